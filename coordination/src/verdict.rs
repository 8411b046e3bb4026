//! Build verdicts and raw remote status.

use serde::{Deserialize, Serialize};

/// Outcome of validating one artifact state on the build service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildVerdict {
    Success,
    Failure {
        log: String,
    },
    /// The service did not conclude within the poll budget.
    Timeout,
    ServiceError {
        reason: String,
        /// Set when retrying cannot help (auth rejected, package disabled).
        #[serde(default)]
        fatal: bool,
    },
}

impl BuildVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Timeout and service errors say nothing about the package itself.
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::Timeout | Self::ServiceError { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServiceError { fatal: true, .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Timeout => "timeout",
            Self::ServiceError { .. } => "service_error",
        }
    }

    /// Build log carried by a failure, if any.
    pub fn log(&self) -> Option<&str> {
        match self {
            Self::Failure { log } => Some(log),
            _ => None,
        }
    }
}

/// What a single status query returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending { code: String },
    Success,
    Failure { log: String },
    /// The service will never build this package as configured.
    Error { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_serializes_tagged() {
        let v = BuildVerdict::Failure {
            log: "ld: unknown arch".into(),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["log"], "ld: unknown arch");

        let back: BuildVerdict =
            serde_json::from_str(r#"{"kind":"service_error","reason":"503"}"#).unwrap();
        assert_eq!(
            back,
            BuildVerdict::ServiceError {
                reason: "503".into(),
                fatal: false
            }
        );
    }

    #[test]
    fn classification() {
        assert!(BuildVerdict::Timeout.is_inconclusive());
        assert!(!BuildVerdict::Success.is_inconclusive());
        assert!(BuildVerdict::ServiceError {
            reason: "disabled".into(),
            fatal: true
        }
        .is_fatal());
        assert_eq!(BuildVerdict::Timeout.label(), "timeout");
    }
}
