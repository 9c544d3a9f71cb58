//! Sync queue dispatcher
//!
//! The [`SyncDispatcher`] drains the durable sync queue against the remote
//! client. It is invoked by any trigger source (periodic timer, immediate
//! request, connectivity-regained event) and relies on a single-flight
//! guard to collapse concurrent triggers into one active drain.
//!
//! ## Dispatch Flow
//!
//! 1. **Connectivity gate**: offline means an immediate no-op
//! 2. **Single-flight guard**: a drain already in flight means a no-op
//! 3. **Drain**: fetch retryable operations in creation order; per
//!    operation check backoff eligibility, drop orphans, replay the
//!    mutation, and on success delete the operation and mark the record
//!    synced
//! 4. **Summary**: per-operation failures never abort the batch; the
//!    caller gets aggregate counts
//!
//! A connectivity loss between the gate and a remote call is tolerated:
//! the affected operations just gain an attempt and wait out their tier.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use chronosync_core::domain::{
    activity::ActivityRecord,
    operation::{FieldUpdate, OperationKind, SyncOperation},
};
use chronosync_core::ports::{
    IConnectivityMonitor, IRemoteClient, IStateRepository, RemoteError,
};

// ============================================================================
// DispatchOutcome
// ============================================================================

/// Result of a dispatch invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The connectivity gate was closed; nothing was attempted
    NetworkUnavailable,
    /// Another drain was already in flight; this invocation was a no-op
    AlreadyRunning,
    /// The batch ran to completion
    ///
    /// "Success" means the drain finished, not that every operation
    /// succeeded; `failed` counts operations left queued with an
    /// incremented attempt.
    Success {
        /// Operations replayed and removed from the queue
        succeeded: u32,
        /// Operations that failed and remain queued
        failed: u32,
    },
}

// ============================================================================
// Single-flight guard
// ============================================================================

/// Clears the in-flight flag when the drain ends, even on early error paths
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// SyncDispatcher
// ============================================================================

/// Drains the sync queue against the remote client
///
/// ## Dependencies
///
/// - `repository`: the durable queue and activity cache
/// - `remote`: the remote store of record
/// - `monitor`: connectivity gate for the drain as a whole
pub struct SyncDispatcher {
    repository: Arc<dyn IStateRepository>,
    remote: Arc<dyn IRemoteClient>,
    monitor: Arc<dyn IConnectivityMonitor>,
    in_flight: AtomicBool,
}

impl SyncDispatcher {
    /// Creates a new dispatcher with the given dependencies
    pub fn new(
        repository: Arc<dyn IStateRepository>,
        remote: Arc<dyn IRemoteClient>,
        monitor: Arc<dyn IConnectivityMonitor>,
    ) -> Self {
        Self {
            repository,
            remote,
            monitor,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Runs one drain pass over the queue
    ///
    /// Safe to invoke from any number of concurrent trigger sources;
    /// duplicate invocations observe [`DispatchOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Returns an error only when the queue itself cannot be read.
    /// Per-operation failures are absorbed into the outcome counts.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self) -> Result<DispatchOutcome> {
        if !self.monitor.is_available() {
            debug!("Dispatch skipped: network unavailable");
            return Ok(DispatchOutcome::NetworkUnavailable);
        }

        // Single-flight: at-least-once schedulers may fire concurrently
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Dispatch skipped: drain already in flight");
            return Ok(DispatchOutcome::AlreadyRunning);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let operations = self
            .repository
            .retryable_operations()
            .await
            .context("Failed to fetch retryable operations")?;

        info!(pending = operations.len(), "Starting queue drain");

        let mut succeeded: u32 = 0;
        let mut failed: u32 = 0;

        for operation in &operations {
            let now = Utc::now();

            if !operation.can_retry_now(now) {
                debug!(
                    operation_id = %operation.id(),
                    attempts = operation.attempts(),
                    "Operation still backing off, skipping"
                );
                continue;
            }

            match self.dispatch_one(operation).await {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        operation_id = %operation.id(),
                        kind = %operation.kind(),
                        record_id = %operation.record_id(),
                        error = %err,
                        "Operation failed, leaving queued"
                    );
                    failed += 1;
                    // Failures are isolated; bookkeeping errors here are
                    // logged and the drain moves on to the next operation.
                    if let Err(store_err) = self.note_failure(operation).await {
                        error!(
                            operation_id = %operation.id(),
                            error = %store_err,
                            "Failed to record attempt"
                        );
                    }
                }
            }
        }

        info!(succeeded, failed, "Queue drain completed");

        Ok(DispatchOutcome::Success { succeeded, failed })
    }

    /// Replays a single operation against the remote store
    ///
    /// Returns `Ok(true)` when the operation was replayed and deleted,
    /// `Ok(false)` when it was dropped without a remote call (orphan or
    /// corrupt payload), and `Err` on a remote failure that should count
    /// an attempt.
    async fn dispatch_one(&self, operation: &SyncOperation) -> Result<bool> {
        // An operation whose record is gone locally can never be replayed
        // meaningfully; drop it.
        let record = self
            .repository
            .get_record(operation.record_id())
            .await
            .context("Failed to look up record for operation")?;

        let Some(record) = record else {
            warn!(
                operation_id = %operation.id(),
                record_id = %operation.record_id(),
                "Dropping orphaned operation (record no longer exists)"
            );
            self.repository
                .delete_operation(operation.id())
                .await
                .context("Failed to delete orphaned operation")?;
            return Ok(false);
        };

        let update = match operation.decode_payload() {
            Ok(update) => update,
            Err(err) => {
                // Corrupt payloads cannot be repaired by retrying; drop the
                // operation so it stops clogging the queue.
                error!(
                    operation_id = %operation.id(),
                    kind = %operation.kind(),
                    error = %err,
                    "Dropping operation with corrupt payload"
                );
                self.repository
                    .delete_operation(operation.id())
                    .await
                    .context("Failed to delete corrupt operation")?;
                return Ok(false);
            }
        };

        match self.call_remote(operation, &record, &update).await {
            Ok(()) => {
                self.repository
                    .delete_operation(operation.id())
                    .await
                    .context("Failed to delete completed operation")?;

                let mut synced = record;
                synced.mark_synced();
                self.repository
                    .save_record(&synced)
                    .await
                    .context("Failed to mark record synced")?;

                debug!(
                    operation_id = %operation.id(),
                    kind = %operation.kind(),
                    record_id = %operation.record_id(),
                    "Operation replayed"
                );
                Ok(true)
            }
            Err(RemoteError::InvalidPayload(reason)) => {
                error!(
                    operation_id = %operation.id(),
                    kind = %operation.kind(),
                    %reason,
                    "Remote rejected payload, dropping operation"
                );
                self.repository
                    .delete_operation(operation.id())
                    .await
                    .context("Failed to delete rejected operation")?;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Issues the remote call matching the operation kind
    ///
    /// `Create` sends the record's current local fields; every other kind
    /// replays the values captured in the operation payload as the
    /// authoritative ones (last-write-wins, no version check).
    async fn call_remote(
        &self,
        operation: &SyncOperation,
        record: &ActivityRecord,
        update: &FieldUpdate,
    ) -> Result<(), RemoteError> {
        match operation.kind() {
            OperationKind::Create => {
                self.remote.create_record(record).await?;
            }
            OperationKind::End => {
                let end_time = update.end_time.ok_or_else(|| {
                    RemoteError::InvalidPayload("end operation without end time".to_string())
                })?;
                self.remote
                    .end_record(operation.record_id(), operation.owner_id(), end_time)
                    .await?;
            }
            OperationKind::Update
            | OperationKind::UpdateStartTime
            | OperationKind::UpdateTimes
            | OperationKind::UpdateNotes => {
                self.remote
                    .update_record(operation.record_id(), operation.owner_id(), update)
                    .await?;
            }
        }
        Ok(())
    }

    /// Records a failed attempt on the operation and the record
    async fn note_failure(&self, operation: &SyncOperation) -> Result<()> {
        let now = Utc::now();

        self.repository
            .record_attempt(operation.id(), now)
            .await
            .context("Failed to record operation attempt")?;

        if let Some(mut record) = self
            .repository
            .get_record(operation.record_id())
            .await
            .context("Failed to load record for attempt bookkeeping")?
        {
            record.record_sync_attempt(now);
            self.repository
                .save_record(&record)
                .await
                .context("Failed to save record attempt bookkeeping")?;
        }

        Ok(())
    }
}
