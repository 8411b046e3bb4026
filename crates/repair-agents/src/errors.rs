//! Repair error taxonomy with retry classification.
//!
//! Every error the repair loop can see is represented here. The session asks
//! `is_fatal()` to choose between absorbing an error into the loop as a failed
//! iteration and aborting with an explicit terminal status.
//!
//! | Variant               | Fatal | Loop treatment                         |
//! |-----------------------|-------|----------------------------------------|
//! | ModelUnavailable      | yes   | abort                                  |
//! | InvalidTarget         | no    | recorded as a failed iteration         |
//! | Io                    | yes*  | abort (patch rejections are not fatal) |
//! | Service               | no*   | resubmit, then failed iteration        |
//! | IterationLimitReached | no    | expected end, status `Failed`          |
//! | Cancelled             | yes   | abort                                  |
//! | Configuration         | yes   | refused before the first iteration     |

use std::fmt;

use repair_coordination::{ArtifactError, ServiceError};
use thiserror::Error;

/// Classification recorded with every failure; decides between continuing
/// the loop and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network blip or 5xx from a remote endpoint.
    Transient,
    /// 429 from a remote endpoint.
    RateLimit,
    /// Costs one iteration, then the loop continues.
    IterationFailure,
    /// Budget spent; terminal but expected.
    MaxIterations,
    /// Nothing to retry; the session must stop.
    Fatal,
    Cancelled,
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::IterationFailure => write!(f, "iteration_failure"),
            Self::MaxIterations => write!(f, "max_iterations"),
            Self::Fatal => write!(f, "fatal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RepairError {
    /// The coordinator spent its retry budget without a usable response.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// An action named a file that is unknown or may not be changed.
    #[error("invalid target: {path}")]
    InvalidTarget { path: String },

    #[error("artifact error: {0}")]
    Io(ArtifactError),

    #[error("build service error: {0}")]
    Service(ServiceError),

    #[error("iteration limit ({0}) reached")]
    IterationLimitReached(u32),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ArtifactError> for RepairError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::InvalidTarget { path, .. } => Self::InvalidTarget { path },
            other => Self::Io(other),
        }
    }
}

impl From<ServiceError> for RepairError {
    fn from(err: ServiceError) -> Self {
        Self::Service(err)
    }
}

impl RepairError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::ModelUnavailable(_) => RetryCategory::Fatal,
            Self::InvalidTarget { .. } => RetryCategory::IterationFailure,
            Self::Io(e) if e.is_fatal() => RetryCategory::Fatal,
            Self::Io(_) => RetryCategory::IterationFailure,
            Self::Service(e) if e.is_fatal() => RetryCategory::Fatal,
            Self::Service(ServiceError::Http { status: 429, .. }) => RetryCategory::RateLimit,
            Self::Service(e) if e.is_transient() => RetryCategory::Transient,
            Self::Service(_) => RetryCategory::IterationFailure,
            Self::IterationLimitReached(_) => RetryCategory::MaxIterations,
            Self::Cancelled(_) => RetryCategory::Cancelled,
            Self::Configuration(_) | Self::Internal(_) => RetryCategory::Fatal,
        }
    }

    /// Fatal errors end the session as `Aborted`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.retry_category(),
            RetryCategory::Fatal | RetryCategory::Cancelled
        )
    }
}
