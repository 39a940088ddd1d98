//! Error types for the promotion kernel
//!
//! `StepError` is the taxonomy every step reports in:
//! - `NotFound`: the primary resource does not resolve (fatal)
//! - `Conflict`: a concurrent write was detected (fatal, re-trigger to retry)
//! - `SchemaMismatch`: a snapshot is malformed (fatal)
//! - `TransientInfra`: throttling or timeouts (absorbed by the retry loop)
//! - `Configuration`: the workflow cannot be built (fatal at construction)

use crate::types::{EventId, StepId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result alias for step operations
pub type StepResult<T> = Result<T, StepError>;

/// Coarse error classification reported through the status interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Primary resource unresolvable
    NotFound,
    /// Concurrent write detected
    Conflict,
    /// Malformed snapshot
    SchemaMismatch,
    /// Throttling, timeouts and similar
    TransientInfra,
    /// Workflow could not be constructed
    Configuration,
}

impl ErrorKind {
    /// Stable name used in logs and reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::TransientInfra => "transient_infra",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while executing a step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Resource identifier did not resolve
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Version check on write failed
    #[error("concurrent modification of {resource}: expected version {expected}, found {actual}")]
    Conflict {
        /// Resource being written
        resource: String,
        /// Version read before the write
        expected: String,
        /// Version found at write time
        actual: String,
    },

    /// Snapshot failed schema validation
    #[error("snapshot does not match the configuration schema: {0}")]
    SchemaMismatch(String),

    /// Retryable infrastructure failure
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Missing export, missing context and similar
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient failures outlasted the retry budget
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Last transient error observed
        last: Box<StepError>,
    },
}

impl StepError {
    /// Classification for the status interface
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            Self::TransientInfra(_) | Self::RetriesExhausted { .. } => ErrorKind::TransientInfra,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the retry loop may absorb this error
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_))
    }

    /// Whether a fresh trigger of the whole wave may succeed
    #[inline]
    #[must_use]
    pub fn is_retriable_by_retrigger(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::RetriesExhausted { .. })
    }

    /// Kind plus human-readable cause
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Error surfaced to the pipeline and operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable cause
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Step graph errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Edge would close a cycle
    #[error("dependency would create a cycle")]
    CycleDetected,
    /// Step is not part of the graph
    #[error("step not found: {0}")]
    StepNotFound(StepId),
    /// Step depends on itself
    #[error("step {0} cannot depend on itself")]
    SelfLoop(StepId),
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the table
    #[error("illegal {machine} transition: {from} -> {to}")]
    IllegalTransition {
        /// Machine name
        machine: &'static str,
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },
}

/// Audit log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Hash chain does not verify
    #[error("audit chain broken at event {0}")]
    IntegrityViolation(EventId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display() {
        let err = StepError::NotFound("primary-1".to_string());
        assert!(err.to_string().contains("primary-1"));
    }

    #[test]
    fn only_transient_errors_are_absorbed() {
        assert!(StepError::TransientInfra("throttled".into()).is_transient());
        assert!(!StepError::NotFound("x".into()).is_transient());
        assert!(!StepError::SchemaMismatch("x".into()).is_transient());
        let conflict = StepError::Conflict {
            resource: "primary-1".into(),
            expected: "E1".into(),
            actual: "E2".into(),
        };
        assert!(!conflict.is_transient());
        assert!(conflict.is_retriable_by_retrigger());
    }

    #[test]
    fn exhausted_retries_report_as_transient_kind() {
        let err = StepError::RetriesExhausted {
            attempts: 5,
            last: Box::new(StepError::TransientInfra("timeout".into())),
        };
        assert_eq!(err.kind(), ErrorKind::TransientInfra);
        assert!(!err.is_transient());

        let detail = err.detail();
        assert_eq!(detail.kind, ErrorKind::TransientInfra);
        assert!(detail.message.contains("5 attempts"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SchemaMismatch).unwrap();
        assert_eq!(json, "\"schema_mismatch\"");
    }
}
