//! Error types for the deterministic repair core.
//!
//! Two families live here: [`ArtifactError`] for anything touching the staged
//! working copy, and [`ServiceError`] for the remote build-service boundary.
//! Callers classify them with `is_fatal()` / `is_transient()` instead of
//! matching on message text.

use std::path::PathBuf;

use thiserror::Error;

use crate::patch::DiffError;

/// Errors raised while reading or mutating the staged package.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The action names a path that is unknown or may not be changed.
    #[error("invalid target: {path} ({reason})")]
    InvalidTarget { path: String, reason: &'static str },

    /// The diff did not apply cleanly to the current content.
    #[error("patch rejected for {path}: {source}")]
    PatchRejected {
        path: String,
        #[source]
        source: DiffError,
    },

    /// The package directory has no build spec file.
    #[error("no .spec file found in {0}")]
    MissingSpec(PathBuf),

    /// A source archive exists but cannot be opened or listed.
    #[error("unreadable archive {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_target(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidTarget {
            path: path.into(),
            reason,
        }
    }

    /// Fatal errors leave the package unusable; the others only spoil the
    /// current iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Archive { .. } | Self::MissingSpec(_)
        )
    }
}

/// Errors at the remote build-service boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection reset, DNS failure, request timeout.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// Credentials rejected; retrying cannot help.
    #[error("authentication rejected by build service")]
    Auth,

    /// The service answered with something we cannot interpret, or refuses to
    /// build the package at all (disabled / excluded).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upload rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// At-least-once retry is allowed for these.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Auth | Self::Protocol(_) | Self::Rejected(_) => false,
        }
    }

    /// Retrying later cannot help either: credentials or the upload set are
    /// wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth | Self::Rejected(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Self::Auth;
            }
            return Self::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        Self::Transport(err.to_string())
    }
}
