//! Upload-then-poll submission with bounded waiting.
//!
//! [`BuildSubmitter::submit`] turns the two build-service calls into a single
//! [`BuildVerdict`]. Every wait is bounded by [`SubmitterConfig`]: exceeding
//! `max_polls` yields `Timeout`, never an indefinite block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{BuildService, SubmissionHandle};
use crate::artifact::ArtifactStore;
use crate::error::{ArtifactError, ServiceError};
use crate::verdict::{BuildVerdict, RemoteStatus};

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Delay before each status query.
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Extra upload attempts after a transient transport failure.
    pub upload_retries: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_polls: 6,
            upload_retries: 2,
        }
    }
}

/// Shared cap on concurrent submissions across sessions.
#[derive(Debug, Clone)]
pub struct SubmissionPermits {
    sem: Arc<Semaphore>,
}

impl SubmissionPermits {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Protocol("submission permits closed".into()))
    }
}

/// Per-session submitter. Remembers the digest of the last uploaded state so
/// an unchanged working copy is re-polled rather than uploaded twice.
pub struct BuildSubmitter {
    service: Arc<dyn BuildService>,
    config: SubmitterConfig,
    permits: Option<SubmissionPermits>,
    last_upload: Option<(String, SubmissionHandle)>,
    uploads: u32,
}

impl BuildSubmitter {
    pub fn new(service: Arc<dyn BuildService>, config: SubmitterConfig) -> Self {
        Self {
            service,
            config,
            permits: None,
            last_upload: None,
            uploads: 0,
        }
    }

    pub fn with_permits(mut self, permits: SubmissionPermits) -> Self {
        self.permits = Some(permits);
        self
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    /// Number of uploads actually sent to the service.
    pub fn upload_count(&self) -> u32 {
        self.uploads
    }

    /// Upload the working copy, retrying transient transport failures with
    /// exponential backoff.
    pub async fn upload_files(
        &self,
        store: &ArtifactStore,
    ) -> Result<SubmissionHandle, ServiceError> {
        let package = &store.package().id;
        let files = store.upload_set();
        let mut attempt = 0;
        loop {
            match self.service.upload(package, store.root(), &files).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() && attempt < self.config.upload_retries => {
                    let delay = Duration::from_secs(2u64.pow(attempt + 1));
                    warn!(
                        package = %package,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A single status query mapped onto a verdict. `None` means the build is
    /// still pending; the caller decides whether to ask again.
    pub async fn check_once(
        &self,
        handle: &SubmissionHandle,
    ) -> Result<Option<BuildVerdict>, ServiceError> {
        Ok(match self.service.status(handle).await? {
            RemoteStatus::Pending { code } => {
                debug!(package = %handle.package, code = %code, "build pending");
                None
            }
            RemoteStatus::Success => Some(BuildVerdict::Success),
            RemoteStatus::Failure { log } => Some(BuildVerdict::Failure { log }),
            RemoteStatus::Error { reason } => Some(BuildVerdict::ServiceError {
                reason,
                fatal: true,
            }),
        })
    }

    /// Upload the current state (unless unchanged since the last upload) and
    /// poll until a verdict or the poll budget runs out.
    ///
    /// Only reading the working copy can fail; service trouble is reported as
    /// a verdict.
    pub async fn submit(&mut self, store: &ArtifactStore) -> Result<BuildVerdict, ArtifactError> {
        let digest = store.digest()?;
        let package = store.package().id.clone();

        let _permit = match &self.permits {
            Some(p) => match p.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => return Ok(service_verdict(&e)),
            },
            None => None,
        };

        let unchanged = match &self.last_upload {
            Some((last, handle)) if *last == digest => Some(handle.clone()),
            _ => None,
        };
        let handle = match unchanged {
            Some(handle) => {
                info!(package = %package, "artifact unchanged since last upload, re-polling");
                handle
            }
            None => match self.upload_files(store).await {
                Ok(handle) => {
                    self.uploads += 1;
                    self.last_upload = Some((digest, handle.clone()));
                    handle
                }
                Err(e) => {
                    warn!(package = %package, error = %e, "upload failed");
                    return Ok(service_verdict(&e));
                }
            },
        };

        let mut saw_answer = false;
        let mut last_error: Option<ServiceError> = None;

        for poll in 1..=self.config.max_polls {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.check_once(&handle).await {
                Ok(Some(verdict)) => {
                    info!(package = %package, poll, verdict = verdict.label(), "build concluded");
                    return Ok(verdict);
                }
                Ok(None) => saw_answer = true,
                Err(e) if e.is_fatal() => return Ok(service_verdict(&e)),
                Err(e) => {
                    warn!(package = %package, poll, error = %e, "status query failed");
                    last_error = Some(e);
                }
            }
        }

        Ok(match last_error {
            Some(e) if !saw_answer => service_verdict(&e),
            _ => {
                warn!(package = %package, polls = self.config.max_polls, "build did not conclude in time");
                BuildVerdict::Timeout
            }
        })
    }
}

fn service_verdict(e: &ServiceError) -> BuildVerdict {
    BuildVerdict::ServiceError {
        reason: e.to_string(),
        fatal: e.is_fatal(),
    }
}
