//! Remote build-service boundary.
//!
//! [`BuildService`] is the two-call contract the repair loop depends on:
//! `upload` pushes the working copy and returns an opaque handle, `status`
//! performs exactly one query against that handle. Polling policy lives in
//! [`BuildSubmitter`], never in the service.

pub mod obs;
pub mod submitter;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::verdict::RemoteStatus;

pub use obs::{ObsClient, ObsConfig};
pub use submitter::{BuildSubmitter, SubmissionPermits, SubmitterConfig};

/// Opaque reference to one uploaded artifact state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub package: String,
    /// Service-specific identifier (revision, job id, or package name).
    pub id: String,
    pub submitted_at: DateTime<Utc>,
}

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Upload `files` (relative to `root`) as the sources of `package`.
    async fn upload(
        &self,
        package: &str,
        root: &Path,
        files: &[String],
    ) -> Result<SubmissionHandle, ServiceError>;

    /// One status query. Must not block waiting for the build.
    async fn status(&self, handle: &SubmissionHandle) -> Result<RemoteStatus, ServiceError>;
}
