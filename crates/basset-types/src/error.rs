//! Error taxonomy shared by the engine, providers and storage backends.
//!
//! Every failure a step can produce carries an [`ErrorKind`]. The kind alone
//! decides whether the failure is transient (worth retrying) or permanent.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // -- transient --
    Timeout,
    Network,
    Navigation,
    ElementNotFound,
    StaleReference,
    ClickIntercepted,
    // -- permanent --
    Validation,
    Configuration,
    Security,
    Quota,
    Permission,
    Capture,
    Expression,
    Provider,
    Internal,
    /// Several branches of a parallel step failed.
    Aggregate,
}

impl ErrorKind {
    /// Whether errors of this kind are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Network
                | ErrorKind::Navigation
                | ErrorKind::ElementNotFound
                | ErrorKind::StaleReference
                | ErrorKind::ClickIntercepted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Navigation => "navigation",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::StaleReference => "stale_reference",
            ErrorKind::ClickIntercepted => "click_intercepted",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Security => "security",
            ErrorKind::Quota => "quota",
            ErrorKind::Permission => "permission",
            ErrorKind::Capture => "capture",
            ErrorKind::Expression => "expression",
            ErrorKind::Provider => "provider",
            ErrorKind::Internal => "internal",
            ErrorKind::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// A classified failure produced while running a step.
///
/// Providers return these directly so the retry policy can act on the kind
/// without inspecting message text.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum StepError {
    /// Worth retrying per the active retry policy.
    #[error("{kind} error: {message}")]
    Transient { kind: ErrorKind, message: String },

    /// Never retried.
    #[error("{kind} error: {message}")]
    Permanent { kind: ErrorKind, message: String },

    /// One or more branches of a parallel step failed.
    #[error("{} of {total} branches of parallel step '{step_id}' failed", .errors.len())]
    Aggregate {
        step_id: String,
        total: usize,
        errors: Vec<BranchFailure>,
    },
}

/// The failure of a single parallel branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailure {
    /// Zero-based branch index.
    pub branch: usize,
    pub error: StepError,
}

impl StepError {
    /// Build an error whose class follows from its kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        if kind.is_transient() {
            StepError::Transient { kind, message }
        } else {
            StepError::Permanent { kind, message }
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn expression(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The kind of this error (`Aggregate` for parallel failures).
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Transient { kind, .. } | StepError::Permanent { kind, .. } => *kind,
            StepError::Aggregate { .. } => ErrorKind::Aggregate,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            StepError::Transient { message, .. } | StepError::Permanent { message, .. } => {
                message.clone()
            }
            StepError::Aggregate { .. } => self.to_string(),
        }
    }

    /// Only transient errors are retried; aggregates never are as a unit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient { .. })
    }
}

// ---------------------------------------------------------------------------
// RepositoryError
// ---------------------------------------------------------------------------

/// Errors from key/value and repository backends.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::Navigation,
            ErrorKind::ElementNotFound,
            ErrorKind::StaleReference,
            ErrorKind::ClickIntercepted,
        ] {
            assert!(kind.is_transient(), "{kind} should be transient");
        }
    }

    #[test]
    fn test_permanent_kinds() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Configuration,
            ErrorKind::Security,
            ErrorKind::Quota,
            ErrorKind::Permission,
            ErrorKind::Aggregate,
        ] {
            assert!(!kind.is_transient(), "{kind} should be permanent");
        }
    }

    #[test]
    fn test_step_error_class_follows_kind() {
        let err = StepError::new(ErrorKind::StaleReference, "node detached");
        assert!(matches!(err, StepError::Transient { .. }));
        assert!(err.is_retryable());

        let err = StepError::new(ErrorKind::Quota, "daily limit reached");
        assert!(matches!(err, StepError::Permanent { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::timeout("navigation took longer than 30000ms");
        assert_eq!(
            err.to_string(),
            "timeout error: navigation took longer than 30000ms"
        );
    }

    #[test]
    fn test_aggregate_error_display_and_kind() {
        let err = StepError::Aggregate {
            step_id: "fan-out".to_string(),
            total: 3,
            errors: vec![BranchFailure {
                branch: 1,
                error: StepError::validation("bad input"),
            }],
        };
        assert_eq!(err.kind(), ErrorKind::Aggregate);
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("1 of 3"), "got: {msg}");
        assert!(msg.contains("fan-out"), "got: {msg}");
    }

    #[test]
    fn test_step_error_serde_roundtrip() {
        let err = StepError::new(ErrorKind::ElementNotFound, "#submit");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["class"], "transient");
        assert_eq!(json["kind"], "element_not_found");
        let back: StepError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }
}
