//! Remote client port (driven/secondary port)
//!
//! This module defines the interface for the remote store of record. The
//! concrete transport (HTTP, gRPC, a vendor SDK) lives in an adapter; the
//! engine only depends on this trait and on the error taxonomy below,
//! which drives the retry decision in the dispatcher.
//!
//! ## Design Notes
//!
//! - Unlike the state repository port, this port uses a typed error:
//!   the dispatcher must distinguish transient failures (retry with
//!   backoff) from payload corruption (drop the operation) and from
//!   authentication failures (bounded retries, surfaced for re-auth).
//! - `RemoteRecord` is a port-level DTO, not a domain entity; the engine
//!   maps it to `ActivityRecord` where needed.
//! - Creates are keyed by the client-generated record id, which makes
//!   redelivery of the same Create operation idempotent on the remote
//!   side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    activity::{ActivityKind, ActivityRecord},
    newtypes::{OwnerId, RecordId},
    operation::FieldUpdate,
};

// ============================================================================
// RemoteError taxonomy
// ============================================================================

/// Errors surfaced by remote client adapters
///
/// The variants encode the retry decision, not the transport detail:
/// adapters map their own failures (HTTP status, socket errors, SDK
/// exceptions) onto this taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The caller must re-authenticate before the request can succeed
    #[error("Authentication required: {0}")]
    Auth(String),

    /// The request payload was rejected as malformed
    ///
    /// Non-retryable: replaying the same payload can never succeed, so
    /// the dispatcher drops the operation and logs the event.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The referenced record does not exist remotely
    #[error("Remote record not found: {0}")]
    NotFound(String),

    /// The remote store could not be reached or answered with a transient
    /// failure (timeout, 5xx, connection reset)
    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns true for failures that can succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }

    /// Returns true for payload faults that no retry can repair
    pub fn is_payload_fault(&self) -> bool {
        matches!(self, RemoteError::InvalidPayload(_))
    }
}

// ============================================================================
// RemoteRecord DTO
// ============================================================================

/// A record as the remote store reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record identifier (the client-generated id, echoed back)
    pub id: RecordId,
    /// Owner the record belongs to
    pub owner_id: OwnerId,
    /// Kind of activity
    pub kind: ActivityKind,
    /// When the activity started
    pub start_time: DateTime<Utc>,
    /// When the activity ended, if it has
    pub end_time: Option<DateTime<Utc>>,
    /// Free-form notes
    pub notes: Option<String>,
    /// Opaque kind-specific fields
    pub fields: serde_json::Value,
    /// When the remote store last modified the record
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// IRemoteClient trait
// ============================================================================

/// Port trait for the remote store of record
///
/// ## Implementation Notes
///
/// - All methods assume authentication has happened out of band; an
///   expired session surfaces as [`RemoteError::Auth`].
/// - Implementations must treat `create_record` as an upsert keyed by the
///   record id so the engine's at-least-once delivery cannot duplicate
///   records.
#[async_trait::async_trait]
pub trait IRemoteClient: Send + Sync {
    /// Creates the record remotely using its current local fields
    ///
    /// Keyed by the client-generated record id: creating an id that
    /// already exists returns the existing remote record instead of
    /// duplicating it.
    async fn create_record(&self, record: &ActivityRecord) -> Result<RemoteRecord, RemoteError>;

    /// Ends an activity remotely at the given time
    async fn end_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        end_time: DateTime<Utc>,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Overwrites the given fields on the remote record
    ///
    /// Last-write-wins: the values in `update` replace the remote values
    /// without any version check.
    async fn update_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        update: &FieldUpdate,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Fetches the most recent records for an owner
    ///
    /// Used for local cache warm-up; not part of the sync-queue critical
    /// path. When `kind` is `None`, all kinds are included.
    async fn fetch_recent(
        &self,
        owner_id: &OwnerId,
        kind: Option<ActivityKind>,
        limit: u32,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}
