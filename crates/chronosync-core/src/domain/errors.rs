//! Domain error types
//!
//! This module defines error types specific to domain operations.
//! These errors are non-retryable by definition: they are reported
//! synchronously from the write call that caused them and are never
//! queued for replay against the remote store.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An ongoing activity of this kind already exists for the owner
    ///
    /// At most one record per `(owner, kind)` may be open-ended at a time.
    #[error("An ongoing {kind} activity already exists for owner {owner}")]
    OngoingActivityExists {
        /// The owner the write was scoped to
        owner: String,
        /// The activity kind of the conflicting record
        kind: String,
    },

    /// No ongoing activity of this kind exists for the owner
    #[error("No ongoing {kind} activity exists for owner {owner}")]
    NoOngoingActivity {
        /// The owner the write was scoped to
        owner: String,
        /// The requested activity kind
        kind: String,
    },

    /// The referenced record does not exist in the local store
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Unknown activity or operation kind name
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
