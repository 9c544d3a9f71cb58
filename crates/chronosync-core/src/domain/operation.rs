//! SyncOperation domain entity and retry/backoff policy
//!
//! A SyncOperation is a queued instruction to replay one mutation against
//! the remote store. Operations are created whenever a write skips or fails
//! its immediate remote attempt, drained FIFO by creation time, and deleted
//! on remote success.
//!
//! ## Retry policy
//!
//! Retries use tiered fixed delays rather than full exponential backoff:
//! 60 s after the first failure, 300 s after the second, 900 s from the
//! third onwards. The fixed tiers bound worst-case retry latency. An
//! operation that reaches `max_retries` is *exhausted*: it stays in the
//! queue for diagnostics and manual retry, but automatic dispatch skips it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{OperationId, OwnerId, RecordId};

// ============================================================================
// OperationKind enum
// ============================================================================

/// The kind of remote mutation a queued operation replays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create the record remotely, using the record's current local fields
    Create,
    /// Overwrite the record's opaque payload fields
    Update,
    /// End the activity remotely
    End,
    /// Move the start time
    UpdateStartTime,
    /// Replace both start and end time
    UpdateTimes,
    /// Replace the notes
    UpdateNotes,
}

impl OperationKind {
    /// Returns the kind name as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::End => "end",
            OperationKind::UpdateStartTime => "update_start_time",
            OperationKind::UpdateTimes => "update_times",
            OperationKind::UpdateNotes => "update_notes",
        }
    }

    /// Parses a kind from its stored string representation
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "end" => Ok(OperationKind::End),
            "update_start_time" => Ok(OperationKind::UpdateStartTime),
            "update_times" => Ok(OperationKind::UpdateTimes),
            "update_notes" => Ok(OperationKind::UpdateNotes),
            other => Err(DomainError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// FieldUpdate payload
// ============================================================================

/// The serialized payload carried by a queued operation
///
/// Field-update operations replay the values captured at enqueue time as
/// the authoritative values (last-write-wins overwrite, no version check).
/// `Create` operations carry an empty update because the dispatcher sends
/// the record's current local fields instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    /// New start time, if the operation moves it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// New end time, if the operation sets or moves it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// New notes, if the operation replaces them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// New opaque payload fields, if the operation overwrites them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<serde_json::Value>,
}

impl FieldUpdate {
    /// An update that carries nothing (used by `Create` operations)
    pub fn none() -> Self {
        Self::default()
    }

    /// An update that only sets the end time
    pub fn end_at(end_time: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(end_time),
            ..Self::default()
        }
    }

    /// An update that only moves the start time
    pub fn start_at(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start_time),
            ..Self::default()
        }
    }

    /// An update that replaces both times
    pub fn times(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            ..Self::default()
        }
    }

    /// An update that replaces the notes
    pub fn notes(notes: Option<String>) -> Self {
        Self {
            notes,
            ..Self::default()
        }
    }

    /// An update that overwrites the opaque payload fields
    pub fn fields(fields: serde_json::Value) -> Self {
        Self {
            fields: Some(fields),
            ..Self::default()
        }
    }
}

// ============================================================================
// Retry tiers
// ============================================================================

/// Fixed retry delays in seconds, indexed by `min(attempts - 1, 2)`
const RETRY_DELAY_TIER_SECS: [i64; 3] = [60, 300, 900];

/// Default number of automatic retries before an operation is exhausted
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// SyncOperation struct
// ============================================================================

/// A queued instruction to replay one mutation against the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique identifier of this queue entry
    id: OperationId,
    /// The kind of remote mutation to replay
    kind: OperationKind,
    /// The record this operation applies to
    record_id: RecordId,
    /// The owner the record belongs to
    owner_id: OwnerId,
    /// Serialized kind-specific payload (a [`FieldUpdate`] as JSON)
    payload: String,
    /// When the operation was enqueued; drives FIFO dispatch order
    created_at: DateTime<Utc>,
    /// Number of dispatch attempts made so far (monotonically non-decreasing)
    attempts: u32,
    /// When the last dispatch attempt was made
    last_attempt: Option<DateTime<Utc>>,
    /// Attempts after which the operation is excluded from automatic dispatch
    max_retries: u32,
}

impl SyncOperation {
    /// Creates a new operation carrying the given field update
    pub fn new(
        kind: OperationKind,
        record_id: RecordId,
        owner_id: OwnerId,
        update: &FieldUpdate,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: OperationId::new(),
            kind,
            record_id,
            owner_id,
            payload: serde_json::to_string(update)?,
            created_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Reconstructs an operation from stored parts
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: OperationId,
        kind: OperationKind,
        record_id: RecordId,
        owner_id: OwnerId,
        payload: String,
        created_at: DateTime<Utc>,
        attempts: u32,
        last_attempt: Option<DateTime<Utc>>,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            kind,
            record_id,
            owner_id,
            payload,
            created_at,
            attempts,
            last_attempt,
            max_retries,
        }
    }

    // --- Getters ---

    /// Returns the operation's unique identifier
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Returns the kind of remote mutation
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns the record this operation applies to
    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    /// Returns the owner the record belongs to
    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// Returns the raw serialized payload
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Returns when the operation was enqueued
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the number of dispatch attempts made
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns when the last dispatch attempt was made
    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }

    /// Returns the configured retry ceiling
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Deserializes the payload into a [`FieldUpdate`]
    ///
    /// A failure here is payload corruption: the operation cannot be
    /// repaired automatically and must be dropped by the dispatcher.
    pub fn decode_payload(&self) -> Result<FieldUpdate, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    // --- Retry policy ---

    /// Returns true when the operation has used up its automatic retries
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Returns the delay that must elapse after the last attempt before
    /// the operation becomes eligible again
    ///
    /// `None` when no attempt has been made yet (immediately eligible).
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.attempts == 0 {
            return None;
        }
        let tier = (self.attempts as usize - 1).min(RETRY_DELAY_TIER_SECS.len() - 1);
        Some(Duration::seconds(RETRY_DELAY_TIER_SECS[tier]))
    }

    /// Returns true if the operation is eligible for dispatch at `now`
    ///
    /// Exhausted operations are never eligible. A never-attempted operation
    /// is always eligible. Otherwise the tier delay must have elapsed since
    /// the last attempt.
    pub fn can_retry_now(&self, now: DateTime<Utc>) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match (self.retry_delay(), self.last_attempt) {
            (None, _) | (_, None) => true,
            (Some(delay), Some(last)) => now - last >= delay,
        }
    }

    /// Records a dispatch attempt at the given time
    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(at);
    }

    /// Re-arms an exhausted operation for manual retry
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}
