//! State repository port (driven/secondary port)
//!
//! This module defines the interface for persisting and querying the local
//! activity cache and the durable sync queue.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, filesystem, etc.) and don't need domain-level classification.
//! - Record and queue operations live on one trait to avoid proliferating
//!   small repository traits; it also lets the adapter expose the combined
//!   transactional write the engine depends on
//!   ([`save_record_with_operation`](IStateRepository::save_record_with_operation)).
//! - Change notification is channel-based: the repository publishes every
//!   durable record write on a broadcast channel and the queue depth on a
//!   watch channel. Consumers filter for the records they care about and
//!   must tolerate duplicate or no-op emissions.

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use crate::domain::{
    activity::{ActivityKind, ActivityRecord},
    newtypes::{OperationId, OwnerId, RecordId},
    operation::SyncOperation,
};

/// Port trait for persistent local state
///
/// This is the single persistence interface of the engine. It covers the
/// activity cache (point reads, predicate reads, change feed) and the sync
/// queue (FIFO of pending remote operations with retry metadata).
///
/// ## Implementation Notes
///
/// - All writes must be durable before the call returns (no write-behind).
/// - `save_record` is an upsert-by-id and therefore idempotent.
/// - `save_record_with_operation` must be a single storage transaction:
///   a record must never exist without its queued (or already-synced)
///   operation, and vice versa.
/// - `pending_count` counts every queued operation, exhausted ones
///   included; `exhausted_count` separates the stuck ones for diagnostics.
#[async_trait::async_trait]
pub trait IStateRepository: Send + Sync {
    // --- Activity record operations ---

    /// Saves a record (insert or update by id)
    async fn save_record(&self, record: &ActivityRecord) -> anyhow::Result<()>;

    /// Retrieves a record by its unique ID
    async fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<ActivityRecord>>;

    /// Retrieves the ongoing (open-ended) record for an owner and kind
    ///
    /// At most one such record exists at a time; the write path enforces
    /// this before persisting.
    async fn get_ongoing(
        &self,
        owner_id: &OwnerId,
        kind: ActivityKind,
    ) -> anyhow::Result<Option<ActivityRecord>>;

    /// Retrieves the most recently completed record for an owner and kind
    ///
    /// "Most recent" is by `end_time`; ongoing records are excluded.
    async fn get_last_completed(
        &self,
        owner_id: &OwnerId,
        kind: ActivityKind,
    ) -> anyhow::Result<Option<ActivityRecord>>;

    /// Queries records whose start time falls within `[from, until]`
    ///
    /// Returns records ordered by start time ascending. When `kind` is
    /// `None`, all kinds are included.
    async fn query_range(
        &self,
        owner_id: &OwnerId,
        kind: Option<ActivityKind>,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ActivityRecord>>;

    /// Subscribes to the record change feed
    ///
    /// An event is published after every durable record write. The feed is
    /// process-local; subscribers do an initial read on top of it to cover
    /// state written before subscription (or in a previous process).
    fn subscribe(&self) -> broadcast::Receiver<ActivityRecord>;

    // --- Sync queue operations ---

    /// Appends an operation to the queue
    async fn enqueue(&self, operation: &SyncOperation) -> anyhow::Result<()>;

    /// Returns the non-exhausted operations in creation order
    ///
    /// Operations with `attempts >= max_retries` are excluded; backoff
    /// eligibility is checked per operation by the dispatcher.
    async fn retryable_operations(&self) -> anyhow::Result<Vec<SyncOperation>>;

    /// Returns every queued operation in creation order (diagnostics)
    async fn all_operations(&self) -> anyhow::Result<Vec<SyncOperation>>;

    /// Deletes an operation from the queue
    async fn delete_operation(&self, id: &OperationId) -> anyhow::Result<()>;

    /// Records a dispatch attempt: increments `attempts`, sets `last_attempt`
    async fn record_attempt(&self, id: &OperationId, at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Re-arms an exhausted operation for manual retry
    async fn reset_attempts(&self, id: &OperationId) -> anyhow::Result<()>;

    /// Returns the number of queued operations (exhausted ones included)
    async fn pending_count(&self) -> anyhow::Result<i64>;

    /// Subscribes to the queue depth
    ///
    /// The watch channel holds the current count at subscription time and
    /// is updated after every queue mutation.
    fn pending_count_stream(&self) -> watch::Receiver<i64>;

    /// Returns the number of exhausted ("stuck") operations
    async fn exhausted_count(&self) -> anyhow::Result<i64>;

    // --- Transactional operations ---

    /// Saves a record and optionally enqueues an operation atomically
    ///
    /// Both writes happen in one storage transaction. Passing `None` for
    /// the operation persists only the record (used when the immediate
    /// remote attempt already succeeded).
    async fn save_record_with_operation(
        &self,
        record: &ActivityRecord,
        operation: Option<&SyncOperation>,
    ) -> anyhow::Result<()>;
}
