//! ActivityRecord domain entity
//!
//! This module defines the ActivityRecord entity: a timestamped unit of
//! tracked activity that is written to the local store first and mirrored
//! to the remote store eventually.
//!
//! ## Sync state
//!
//! ```text
//!     write call            remote success
//!    ┌──────────┐  enqueue  ┌───────────┐   dispatch   ┌──────────┐
//!    │  (new)   │ ────────► │ unsynced  │ ───────────► │  synced  │
//!    └──────────┘           │ (queued)  │              └──────────┘
//!                           └───────────┘                    │
//!                                 ▲                          │
//!                                 └──────── local edit ──────┘
//! ```
//!
//! A record is never deleted by the sync engine; it only moves between
//! `synced == false` (a queued operation exists or a remote attempt is
//! pending) and `synced == true` (the remote store holds an equivalent
//! record).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{OwnerId, RecordId};

// ============================================================================
// ActivityKind enum
// ============================================================================

/// Kind of tracked activity
///
/// The set of timed-activity types the engine recognizes. The ongoing
/// invariant is scoped per `(owner, kind)` pair, so two different kinds
/// may be open-ended at the same time for the same owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A sleep session (typically long-running, always timed)
    Sleep,
    /// A feeding session
    Feeding,
    /// A play or tummy-time session
    Play,
    /// A medication event (usually instantaneous, start == end)
    Medication,
}

impl ActivityKind {
    /// Returns the kind name as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Sleep => "sleep",
            ActivityKind::Feeding => "feeding",
            ActivityKind::Play => "play",
            ActivityKind::Medication => "medication",
        }
    }

    /// Parses a kind from its stored string representation
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "sleep" => Ok(ActivityKind::Sleep),
            "feeding" => Ok(ActivityKind::Feeding),
            "play" => Ok(ActivityKind::Play),
            "medication" => Ok(ActivityKind::Medication),
            other => Err(DomainError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ActivityPayload struct
// ============================================================================

/// Opaque domain payload carried by an activity record
///
/// The engine does not interpret these fields; they are round-tripped
/// between the caller, the local store, and the remote store. `notes` is
/// split out because it has its own update operation; everything else
/// rides in the untyped `fields` value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// Free-form notes attached to the record
    pub notes: Option<String>,
    /// Kind-specific fields (amounts, subtypes, ...), opaque to the engine
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

impl ActivityPayload {
    /// Creates an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a payload with notes only
    pub fn with_notes(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            fields: serde_json::Value::Null,
        }
    }

    /// Creates a payload with kind-specific fields only
    pub fn with_fields(fields: serde_json::Value) -> Self {
        Self {
            notes: None,
            fields,
        }
    }
}

// ============================================================================
// ActivityRecord struct
// ============================================================================

/// A timestamped unit of tracked data, locally cached and eventually
/// mirrored remotely
///
/// ActivityRecord is the core domain entity. It is always written to the
/// local store before any remote call is attempted, and carries its own
/// sync bookkeeping (`synced`, `sync_attempts`, `last_sync_attempt`) so
/// that diagnostics can tell a fresh record from one that has been
/// fighting the network for a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Client-generated unique identifier, reused as the remote key
    id: RecordId,
    /// Owner this record belongs to
    owner_id: OwnerId,
    /// Kind of activity being tracked
    kind: ActivityKind,
    /// When the activity started
    start_time: DateTime<Utc>,
    /// When the activity ended; `None` means the activity is ongoing
    end_time: Option<DateTime<Utc>>,
    /// Opaque domain payload (notes + kind-specific fields)
    payload: ActivityPayload,
    /// When the record was created locally
    created_at: DateTime<Utc>,
    /// When the record was last mutated locally
    updated_at: DateTime<Utc>,
    /// Whether the remote store holds an equivalent record
    synced: bool,
    /// Number of remote sync attempts made for this record
    sync_attempts: u32,
    /// When the last remote sync attempt was made
    last_sync_attempt: Option<DateTime<Utc>>,
}

impl ActivityRecord {
    /// Creates a new ongoing record (no end time) starting at `start_time`
    pub fn start(
        owner_id: OwnerId,
        kind: ActivityKind,
        start_time: DateTime<Utc>,
        payload: ActivityPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            owner_id,
            kind,
            start_time,
            end_time: None,
            payload,
            created_at: now,
            updated_at: now,
            synced: false,
            sync_attempts: 0,
            last_sync_attempt: None,
        }
    }

    /// Creates an instantaneous record with `start == end`
    ///
    /// Used for fire-and-forget events like a medication dose. Instant
    /// records are never ongoing and therefore never participate in the
    /// ongoing invariant.
    pub fn instant(
        owner_id: OwnerId,
        kind: ActivityKind,
        at: DateTime<Utc>,
        payload: ActivityPayload,
    ) -> Self {
        let mut record = Self::start(owner_id, kind, at, payload);
        record.end_time = Some(at);
        record
    }

    /// Reconstructs a record from stored parts
    ///
    /// Used by repository adapters when mapping database rows back into
    /// domain entities. No validation beyond type safety is applied: the
    /// stored state is taken as authoritative.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: RecordId,
        owner_id: OwnerId,
        kind: ActivityKind,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        payload: ActivityPayload,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        synced: bool,
        sync_attempts: u32,
        last_sync_attempt: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            owner_id,
            kind,
            start_time,
            end_time,
            payload,
            created_at,
            updated_at,
            synced,
            sync_attempts,
            last_sync_attempt,
        }
    }

    // --- Getters ---

    /// Returns the record's unique identifier
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Returns the owner identifier
    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// Returns the activity kind
    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// Returns when the activity started
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Returns when the activity ended, if it has
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Returns the opaque payload
    pub fn payload(&self) -> &ActivityPayload {
        &self.payload
    }

    /// Returns when the record was created locally
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the record was last mutated locally
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns whether the remote store holds an equivalent record
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Returns the number of remote sync attempts made
    pub fn sync_attempts(&self) -> u32 {
        self.sync_attempts
    }

    /// Returns when the last remote sync attempt was made
    pub fn last_sync_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_sync_attempt
    }

    /// Returns true if the activity has no end time yet
    pub fn is_ongoing(&self) -> bool {
        self.end_time.is_none()
    }

    /// Returns the elapsed duration, or `None` while the activity is ongoing
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    // --- Mutations ---

    /// Ends the activity at the given time
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if the record is already
    /// ended or if `end_time` precedes `start_time`.
    pub fn end(&mut self, end_time: DateTime<Utc>) -> Result<(), DomainError> {
        if self.end_time.is_some() {
            return Err(DomainError::ValidationFailed(format!(
                "record {} is already ended",
                self.id
            )));
        }
        if end_time < self.start_time {
            return Err(DomainError::ValidationFailed(format!(
                "end time {} precedes start time {}",
                end_time, self.start_time
            )));
        }
        self.end_time = Some(end_time);
        self.touch();
        Ok(())
    }

    /// Moves the start time of the activity
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if the new start time would
    /// fall after an existing end time.
    pub fn set_start_time(&mut self, start_time: DateTime<Utc>) -> Result<(), DomainError> {
        if let Some(end) = self.end_time {
            if start_time > end {
                return Err(DomainError::ValidationFailed(format!(
                    "start time {} is after end time {}",
                    start_time, end
                )));
            }
        }
        self.start_time = start_time;
        self.touch();
        Ok(())
    }

    /// Replaces both start and end time
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if `end_time < start_time`.
    pub fn set_times(
        &mut self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if end_time < start_time {
            return Err(DomainError::ValidationFailed(format!(
                "end time {} precedes start time {}",
                end_time, start_time
            )));
        }
        self.start_time = start_time;
        self.end_time = Some(end_time);
        self.touch();
        Ok(())
    }

    /// Replaces the notes
    pub fn set_notes(&mut self, notes: Option<String>) {
        self.payload.notes = notes;
        self.touch();
    }

    /// Replaces the kind-specific payload fields
    pub fn set_fields(&mut self, fields: serde_json::Value) {
        self.payload.fields = fields;
        self.touch();
    }

    /// Marks the record as mirrored by the remote store
    pub fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Marks the record as diverged from the remote store
    ///
    /// Called on every local mutation of an already-synced record so the
    /// dispatcher knows a replay is outstanding.
    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    /// Records a remote sync attempt at the given time
    pub fn record_sync_attempt(&mut self, at: DateTime<Utc>) {
        self.sync_attempts = self.sync_attempts.saturating_add(1);
        self.last_sync_attempt = Some(at);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.synced = false;
    }
}
