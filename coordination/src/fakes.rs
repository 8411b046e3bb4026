//! In-memory build service for tests.
//!
//! `ScriptedBuildService` answers `upload` and `status` from queues set up by
//! the test and falls back to a fixed answer once a queue is empty. It counts
//! every call so tests can assert on retry and duplicate-upload behaviour.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::build_service::{BuildService, SubmissionHandle};
use crate::error::ServiceError;
use crate::verdict::RemoteStatus;

#[derive(Debug)]
struct Script {
    uploads: VecDeque<Result<(), ServiceError>>,
    statuses: VecDeque<Result<RemoteStatus, ServiceError>>,
    fallback: Result<RemoteStatus, ServiceError>,
    upload_calls: usize,
    status_calls: usize,
    uploaded: Vec<Vec<String>>,
}

#[derive(Debug)]
pub struct ScriptedBuildService {
    script: Mutex<Script>,
}

impl ScriptedBuildService {
    /// Every status query returns `fallback` unless something was queued.
    pub fn new(fallback: Result<RemoteStatus, ServiceError>) -> Self {
        Self {
            script: Mutex::new(Script {
                uploads: VecDeque::new(),
                statuses: VecDeque::new(),
                fallback,
                upload_calls: 0,
                status_calls: 0,
                uploaded: Vec::new(),
            }),
        }
    }

    pub fn always_pending() -> Self {
        Self::new(Ok(RemoteStatus::Pending {
            code: "building".into(),
        }))
    }

    pub fn always_succeeding() -> Self {
        Self::new(Ok(RemoteStatus::Success))
    }

    pub fn always_failing(log: &str) -> Self {
        Self::new(Ok(RemoteStatus::Failure { log: log.into() }))
    }

    /// Queue the result of the next `upload` call.
    pub fn push_upload(self, result: Result<(), ServiceError>) -> Self {
        self.lock().uploads.push_back(result);
        self
    }

    /// Queue the result of the next `status` call.
    pub fn push_status(self, result: Result<RemoteStatus, ServiceError>) -> Self {
        self.lock().statuses.push_back(result);
        self
    }

    pub fn upload_calls(&self) -> usize {
        self.lock().upload_calls
    }

    pub fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    /// File sets of the successful uploads, in order.
    pub fn uploaded(&self) -> Vec<Vec<String>> {
        self.lock().uploaded.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        // A poisoned script only happens after a test already panicked.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BuildService for ScriptedBuildService {
    async fn upload(
        &self,
        package: &str,
        _root: &Path,
        files: &[String],
    ) -> Result<SubmissionHandle, ServiceError> {
        let mut script = self.lock();
        script.upload_calls += 1;
        script.uploads.pop_front().unwrap_or(Ok(()))?;
        script.uploaded.push(files.to_vec());
        Ok(SubmissionHandle {
            package: package.to_string(),
            id: format!("{package}#{}", script.upload_calls),
            submitted_at: Utc::now(),
        })
    }

    async fn status(&self, _handle: &SubmissionHandle) -> Result<RemoteStatus, ServiceError> {
        let mut script = self.lock();
        script.status_calls += 1;
        match script.statuses.pop_front() {
            Some(next) => next,
            None => script.fallback.clone(),
        }
    }
}
