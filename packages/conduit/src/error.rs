//! Structured error types for conduit.
//!
//! `ConduitError` is the single pattern-matchable error surfaced to callers.
//! Storage backends report their own [`BackendError`](crate::BackendError) so the
//! store can tell "not on this backend" apart from "backend is down".
//!
//! # Propagation
//!
//! - `Validation` is surfaced immediately and never retried.
//! - `QueueFull` never reaches an emitter. The router turns it into a dropped
//!   unit, a counter, and a `unit.dropped` trigger.
//! - `DuplicateOperation` exists for callers that prefer an error over the
//!   `acquired = false` answer of the lock registry. It is not retryable: the
//!   operation is already running elsewhere.
//! - `ShardReconstruction` is fatal for that retrieval; the data is gone.
//! - `BackendUnavailable` is only returned after the fallback backend failed too.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::unit::{DestinationId, PriorityClass};

/// Crate-wide result alias.
pub type Result<T, E = ConduitError> = std::result::Result<T, E>;

/// Coarse error category, safe to log or expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input.
    Validation,
    /// Temporary saturation, handled internally.
    Transient,
    /// Same operation already running.
    Duplicate,
    /// Data cannot be recovered.
    Unrecoverable,
    /// Storage could not be reached.
    Unavailable,
    /// Nothing stored under the key.
    NotFound,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Duplicate => write!(f, "duplicate_operation"),
            ErrorCategory::Unrecoverable => write!(f, "unrecoverable"),
            ErrorCategory::Unavailable => write!(f, "unavailable"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

/// Errors returned by conduit operations.
#[derive(Debug, Error)]
pub enum ConduitError {
    /// Input failed validation.
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: Cow<'static, str>,
    },

    /// A priority queue is saturated.
    #[error("{priority} queue for destination {destination} is full")]
    QueueFull {
        destination: DestinationId,
        priority: PriorityClass,
    },

    /// An operation with this signature is already pending or active.
    #[error("operation {signature} is already running")]
    DuplicateOperation { signature: String },

    /// More shards were lost than the parity shards can cover.
    #[error("cannot reconstruct payload: {available} usable shards, {required} required")]
    ShardReconstruction { available: usize, required: usize },

    /// Neither backend accepted or served the request.
    #[error("storage backends unavailable (primary: {primary}; secondary: {secondary})")]
    BackendUnavailable {
        primary: BackendError,
        secondary: BackendError,
    },

    /// No backend holds the key.
    #[error("object {key} not found")]
    NotFound { key: String },

    /// One or more trigger handlers failed; carries the first failure.
    #[error("{failures} handler(s) failed for {event_type}: {error}")]
    HandlerFailed {
        event_type: String,
        failures: usize,
        #[source]
        error: anyhow::Error,
    },

    /// The persisted strand frame is malformed.
    #[error("corrupt strand frame: {0}")]
    CorruptFrame(Cow<'static, str>),

    /// Serialization or erasure-code failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// The lock registry was poisoned by a panicking writer.
    #[error("lock registry poisoned")]
    LockPoisoned,
}

impl ConduitError {
    /// Shorthand for a validation error.
    pub fn validation(field: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        ConduitError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConduitError::Validation { .. } => ErrorCategory::Validation,
            ConduitError::QueueFull { .. } => ErrorCategory::Transient,
            ConduitError::DuplicateOperation { .. } => ErrorCategory::Duplicate,
            ConduitError::ShardReconstruction { .. } | ConduitError::CorruptFrame(_) => {
                ErrorCategory::Unrecoverable
            }
            ConduitError::BackendUnavailable { .. } => ErrorCategory::Unavailable,
            ConduitError::NotFound { .. } => ErrorCategory::NotFound,
            ConduitError::HandlerFailed { .. }
            | ConduitError::Codec(_)
            | ConduitError::LockPoisoned => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Unavailable
        )
    }
}

impl From<reed_solomon_erasure::Error> for ConduitError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        ConduitError::Codec(format!("reed-solomon: {:?}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = ConduitError::validation("destination", "must not be empty");
        assert_eq!(err.to_string(), "invalid destination: must not be empty");
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_shard_reconstruction_is_unrecoverable() {
        let err = ConduitError::ShardReconstruction {
            available: 1,
            required: 2,
        };
        assert!(err.to_string().contains("1 usable shards"));
        assert_eq!(err.category(), ErrorCategory::Unrecoverable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_duplicate_is_not_retryable() {
        let err = ConduitError::DuplicateOperation {
            signature: "export:7".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Duplicate);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_queue_full_is_transient() {
        let err = ConduitError::QueueFull {
            destination: DestinationId::from("ledger"),
            priority: PriorityClass::Control,
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ledger"));
    }

    #[test]
    fn test_backend_unavailable_is_retryable() {
        let err = ConduitError::BackendUnavailable {
            primary: BackendError::unavailable(anyhow::anyhow!("connection refused")),
            secondary: BackendError::NotFound,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_handler_failed_keeps_source() {
        let err = ConduitError::HandlerFailed {
            event_type: "unit.emitted".into(),
            failures: 2,
            error: anyhow::anyhow!("boom"),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("2 handler(s)"));
    }
}
