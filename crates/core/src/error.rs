//! Error types for the aggregator
//!
//! Every fallible operation in the workspace returns [`AggregatorError`].
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Conditions that are an expected consequence of concurrency (two callers
//! creating the same group, two evaluators racing to complete it, a corrupt
//! item row) are not errors. They are described by [`RaceWarning`], logged by
//! the storage layer, and never fail the operation.

use crate::types::GroupKey;
use std::fmt;
use thiserror::Error;

/// Result type alias for aggregator operations
pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Boxed error returned by downstream consumers and observers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for the aggregator
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// Bad caller input. Reported before any storage is touched.
    #[error("Validation error: {field} {reason}")]
    Validation {
        /// Name of the offending input
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Bad storage object name or missing/invalid backend configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transaction or connection failure. The transaction was rolled back.
    #[error("Storage error during {operation}: {message}")]
    Storage {
        /// Store operation that failed
        operation: &'static str,
        /// Backend error message
        message: String,
    },

    /// An item was offered to a group that already completed
    #[error("Group {group} is already complete")]
    GroupClosed {
        /// The completed group
        group: GroupKey,
    },

    /// The downstream consumer failed. The accepted item remains stored.
    #[error("Delivery failed for group {group}: {source}")]
    Delivery {
        /// Group whose batch was being delivered
        group: GroupKey,
        /// Error returned by the consumer
        #[source]
        source: BoxError,
    },
}

impl AggregatorError {
    /// Build a validation error
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AggregatorError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Build a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        AggregatorError::Configuration(message.into())
    }

    /// Build a storage error for the named operation
    pub fn storage(operation: &'static str, err: impl fmt::Display) -> Self {
        AggregatorError::Storage {
            operation,
            message: err.to_string(),
        }
    }

    /// Build a delivery error wrapping the consumer's failure
    pub fn delivery(group: GroupKey, source: BoxError) -> Self {
        AggregatorError::Delivery { group, source }
    }

    /// True for caller input errors
    pub fn is_validation(&self) -> bool {
        matches!(self, AggregatorError::Validation { .. })
    }

    /// True for storage failures
    pub fn is_storage(&self) -> bool {
        matches!(self, AggregatorError::Storage { .. })
    }
}

/// A condition absorbed by the store instead of failing the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceWarning {
    /// Another caller created the group first; the existing row was reused
    DuplicateCreate {
        /// Group that was created concurrently
        group: GroupKey,
    },
    /// `mark_complete` affected zero rows: already complete or removed
    CompletionAlreadyApplied {
        /// Group that was already complete
        group: GroupKey,
    },
    /// An item row could not be read and was skipped
    CorruptItem {
        /// Owning group
        group: GroupKey,
        /// Sequence number, if it could be read
        sequence_number: Option<u64>,
        /// Why the row was rejected
        reason: String,
    },
    /// Rolling back a failed transaction also failed
    RollbackFailed {
        /// Operation whose transaction was being rolled back
        operation: &'static str,
        /// Rollback error message
        reason: String,
    },
}

impl fmt::Display for RaceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceWarning::DuplicateCreate { group } => {
                write!(f, "group {} was created concurrently; reusing existing row", group)
            }
            RaceWarning::CompletionAlreadyApplied { group } => {
                write!(f, "group {} was already completed or removed", group)
            }
            RaceWarning::CorruptItem {
                group,
                sequence_number,
                reason,
            } => match sequence_number {
                Some(seq) => write!(f, "skipping corrupt item {} in group {}: {}", seq, group, reason),
                None => write!(f, "skipping unreadable item in group {}: {}", group, reason),
            },
            RaceWarning::RollbackFailed { operation, reason } => {
                write!(f, "rollback after failed {} also failed: {}", operation, reason)
            }
        }
    }
}
