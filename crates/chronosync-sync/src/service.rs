//! Write/read orchestrator (the offline service)
//!
//! [`OfflineActivityService`] mediates every domain operation. Writes are
//! local-first: the record is durable in the local store before any remote
//! traffic, an optimistic remote attempt follows when the network is
//! available, and on failure or offline the mutation is queued for replay.
//! The caller always gets the locally written record back synchronously;
//! `synced` tells it whether the remote write already landed.
//!
//! Reads are local-first too: known local data is never withheld because
//! the network is down. Connectivity is reported alongside the result for
//! presentation purposes only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chronosync_core::domain::{
    activity::{ActivityKind, ActivityPayload, ActivityRecord},
    errors::DomainError,
    newtypes::{OperationId, OwnerId, RecordId},
    operation::{FieldUpdate, OperationKind, SyncOperation},
};
use chronosync_core::ports::{
    connectivity::ConnectivityStatus, IConnectivityMonitor, IRemoteClient, IStateRepository,
    ISyncScheduler, RemoteError,
};

use crate::timer::ElapsedTimer;
use crate::SyncError;

/// Tick interval for per-ongoing-activity elapsed timers
const TIMER_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Tri-state read results
// ============================================================================

/// Outcome of a local-first read
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Local data exists (regardless of connectivity)
    Found(ActivityRecord),
    /// No local data exists for the query
    Empty,
    /// The local read itself failed
    Error(String),
}

/// One emission of a record stream: the read result plus the connectivity
/// state for UI use. Connectivity never withholds already-known local data.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub result: QueryResult,
    pub connectivity: ConnectivityStatus,
}

#[derive(Debug, Clone, Copy)]
enum RecordSelector {
    Ongoing,
    LastCompleted,
}

/// A continuous stream of [`RecordQuery`] values
///
/// Emits an initial read at subscription time, then re-reads on every
/// matching local write and on every connectivity transition. Duplicate
/// emissions are possible and harmless.
pub struct RecordStream {
    repository: Arc<dyn IStateRepository>,
    monitor: Arc<dyn IConnectivityMonitor>,
    changes: broadcast::Receiver<ActivityRecord>,
    connectivity: chronosync_core::ports::ConnectivityStream,
    owner_id: OwnerId,
    kind: ActivityKind,
    selector: RecordSelector,
    primed: bool,
}

impl RecordStream {
    async fn new(
        repository: Arc<dyn IStateRepository>,
        monitor: Arc<dyn IConnectivityMonitor>,
        owner_id: OwnerId,
        kind: ActivityKind,
        selector: RecordSelector,
    ) -> Self {
        let changes = repository.subscribe();
        let mut connectivity = monitor.status_stream();
        // Consume the stream's initial emission; the first RecordQuery
        // reports connectivity itself, and afterwards only transitions
        // should wake the stream.
        let _ = connectivity.next().await;

        Self {
            repository,
            monitor,
            changes,
            connectivity,
            owner_id,
            kind,
            selector,
            primed: false,
        }
    }

    /// Waits for the next emission
    ///
    /// Returns `None` when both the change feed and the connectivity
    /// monitor have gone away (the repository was dropped).
    pub async fn next(&mut self) -> Option<RecordQuery> {
        if self.primed {
            loop {
                tokio::select! {
                    changed = self.changes.recv() => match changed {
                        Ok(record)
                            if record.owner_id() == &self.owner_id
                                && record.kind() == self.kind =>
                        {
                            break;
                        }
                        Ok(_) => continue,
                        // Falling behind only means re-reading sooner
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                    status = self.connectivity.next() => match status {
                        Some(_) => break,
                        None => return None,
                    },
                }
            }
        }
        self.primed = true;

        Some(self.read().await)
    }

    async fn read(&self) -> RecordQuery {
        let read = match self.selector {
            RecordSelector::Ongoing => {
                self.repository.get_ongoing(&self.owner_id, self.kind).await
            }
            RecordSelector::LastCompleted => {
                self.repository
                    .get_last_completed(&self.owner_id, self.kind)
                    .await
            }
        };

        let result = match read {
            Ok(Some(record)) => QueryResult::Found(record),
            Ok(None) => QueryResult::Empty,
            Err(err) => QueryResult::Error(err.to_string()),
        };

        let connectivity = if self.monitor.is_available() {
            ConnectivityStatus::Available
        } else {
            ConnectivityStatus::Unavailable
        };

        RecordQuery {
            result,
            connectivity,
        }
    }
}

// ============================================================================
// OfflineActivityService
// ============================================================================

/// The write/read orchestrator exposed to callers
///
/// Explicitly constructed by the process entry point, which owns its
/// `init`/`shutdown` lifecycle.
///
/// ## Dependencies
///
/// - `repository`: durable local cache and sync queue
/// - `remote`: remote store of record, used for optimistic attempts and
///   cache warm-up
/// - `monitor`: connectivity gate for optimistic attempts
/// - `scheduler`: drain triggers (periodic and on demand)
pub struct OfflineActivityService {
    repository: Arc<dyn IStateRepository>,
    remote: Arc<dyn IRemoteClient>,
    monitor: Arc<dyn IConnectivityMonitor>,
    scheduler: Arc<dyn ISyncScheduler>,
    timers: Mutex<HashMap<(OwnerId, ActivityKind), ElapsedTimer>>,
    timer_root: CancellationToken,
}

impl OfflineActivityService {
    /// Creates a new service with the given dependencies
    pub fn new(
        repository: Arc<dyn IStateRepository>,
        remote: Arc<dyn IRemoteClient>,
        monitor: Arc<dyn IConnectivityMonitor>,
        scheduler: Arc<dyn ISyncScheduler>,
    ) -> Self {
        Self {
            repository,
            remote,
            monitor,
            scheduler,
            timers: Mutex::new(HashMap::new()),
            timer_root: CancellationToken::new(),
        }
    }

    /// Starts background dispatch triggers
    ///
    /// Schedules the periodic drain and an immediate drain to flush any
    /// queue carried over from a previous process.
    pub fn init(&self, poll_interval: Duration) {
        info!(
            poll_secs = poll_interval.as_secs(),
            "Offline service starting"
        );
        self.scheduler.schedule_periodic(poll_interval, true);
        self.scheduler.schedule_immediate(true);
    }

    /// Stops all triggers and elapsed timers
    pub async fn shutdown(&self) {
        info!("Offline service shutting down");
        self.scheduler.cancel_all();
        self.timer_root.cancel();
        self.timers.lock().await.clear();
    }

    // ========================================================================
    // Write paths
    // ========================================================================

    /// Starts a timed activity
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::OngoingActivityExists`] when an open-ended
    /// record of this kind already exists for the owner. The violation is
    /// reported synchronously and nothing is queued.
    #[tracing::instrument(skip(self, payload))]
    pub async fn start_activity(
        &self,
        owner_id: OwnerId,
        kind: ActivityKind,
        start_time: DateTime<Utc>,
        payload: ActivityPayload,
    ) -> Result<ActivityRecord, SyncError> {
        if self.repository.get_ongoing(&owner_id, kind).await?.is_some() {
            return Err(DomainError::OngoingActivityExists {
                owner: owner_id.to_string(),
                kind: kind.to_string(),
            }
            .into());
        }

        let record = ActivityRecord::start(owner_id, kind, start_time, payload);
        let record = self
            .write_through(record, OperationKind::Create, FieldUpdate::none())
            .await?;

        self.start_timer(&record).await;
        Ok(record)
    }

    /// Ends the ongoing activity of the given kind
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::NoOngoingActivity`] when nothing is ongoing,
    /// or a validation error when `end_time` precedes the start.
    #[tracing::instrument(skip(self))]
    pub async fn end_activity(
        &self,
        owner_id: OwnerId,
        kind: ActivityKind,
        end_time: DateTime<Utc>,
    ) -> Result<ActivityRecord, SyncError> {
        let Some(mut record) = self.repository.get_ongoing(&owner_id, kind).await? else {
            return Err(DomainError::NoOngoingActivity {
                owner: owner_id.to_string(),
                kind: kind.to_string(),
            }
            .into());
        };

        record.end(end_time)?;
        self.cancel_timer(&owner_id, kind).await;

        self.write_through(record, OperationKind::End, FieldUpdate::end_at(end_time))
            .await
    }

    /// Records an instantaneous activity (`start == end`)
    ///
    /// Fire-and-forget: instant records are never ongoing and therefore
    /// never conflict with the ongoing invariant.
    #[tracing::instrument(skip(self, payload))]
    pub async fn log_instant_activity(
        &self,
        owner_id: OwnerId,
        kind: ActivityKind,
        at: DateTime<Utc>,
        payload: ActivityPayload,
    ) -> Result<ActivityRecord, SyncError> {
        let record = ActivityRecord::instant(owner_id, kind, at, payload);
        self.write_through(record, OperationKind::Create, FieldUpdate::none())
            .await
    }

    /// Moves the start time of an existing record
    #[tracing::instrument(skip(self))]
    pub async fn update_start_time(
        &self,
        record_id: &RecordId,
        start_time: DateTime<Utc>,
    ) -> Result<ActivityRecord, SyncError> {
        let mut record = self.load_record(record_id).await?;
        record.set_start_time(start_time)?;

        let record = self
            .write_through(
                record,
                OperationKind::UpdateStartTime,
                FieldUpdate::start_at(start_time),
            )
            .await?;

        // An ongoing record's elapsed timer measures from the start time;
        // re-arm it against the new one.
        if record.is_ongoing() {
            self.start_timer(&record).await;
        }
        Ok(record)
    }

    /// Replaces both start and end time of an existing record
    #[tracing::instrument(skip(self))]
    pub async fn update_times(
        &self,
        record_id: &RecordId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<ActivityRecord, SyncError> {
        let mut record = self.load_record(record_id).await?;
        let was_ongoing = record.is_ongoing();
        record.set_times(start_time, end_time)?;

        if was_ongoing {
            self.cancel_timer(record.owner_id(), record.kind()).await;
        }

        self.write_through(
            record,
            OperationKind::UpdateTimes,
            FieldUpdate::times(start_time, end_time),
        )
        .await
    }

    /// Replaces the notes of an existing record
    #[tracing::instrument(skip(self, notes))]
    pub async fn update_notes(
        &self,
        record_id: &RecordId,
        notes: Option<String>,
    ) -> Result<ActivityRecord, SyncError> {
        let mut record = self.load_record(record_id).await?;
        record.set_notes(notes.clone());

        self.write_through(record, OperationKind::UpdateNotes, FieldUpdate::notes(notes))
            .await
    }

    /// Overwrites the opaque payload fields of an existing record
    #[tracing::instrument(skip(self, fields))]
    pub async fn update_fields(
        &self,
        record_id: &RecordId,
        fields: serde_json::Value,
    ) -> Result<ActivityRecord, SyncError> {
        let mut record = self.load_record(record_id).await?;
        record.set_fields(fields.clone());

        self.write_through(record, OperationKind::Update, FieldUpdate::fields(fields))
            .await
    }

    // ========================================================================
    // Read paths
    // ========================================================================

    /// Streams the ongoing record for an owner and kind
    pub async fn ongoing(&self, owner_id: OwnerId, kind: ActivityKind) -> RecordStream {
        RecordStream::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.monitor),
            owner_id,
            kind,
            RecordSelector::Ongoing,
        )
        .await
    }

    /// Streams the most recently completed record for an owner and kind
    pub async fn last_completed(&self, owner_id: OwnerId, kind: ActivityKind) -> RecordStream {
        RecordStream::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.monitor),
            owner_id,
            kind,
            RecordSelector::LastCompleted,
        )
        .await
    }

    /// Subscribes to the elapsed time of the ongoing activity, if any
    pub async fn elapsed(
        &self,
        owner_id: OwnerId,
        kind: ActivityKind,
    ) -> Option<watch::Receiver<chrono::Duration>> {
        self.timers
            .lock()
            .await
            .get(&(owner_id, kind))
            .map(ElapsedTimer::elapsed)
    }

    // ========================================================================
    // Cache warm-up
    // ========================================================================

    /// Pulls recent remote records into the local cache
    ///
    /// Upserts each fetched record with `synced = true`, skipping any
    /// record that still has a queued operation: a pending local mutation
    /// outranks the remote copy. Not part of the sync-queue critical path.
    ///
    /// Returns the number of records applied locally.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_recent(
        &self,
        owner_id: OwnerId,
        kind: Option<ActivityKind>,
        limit: u32,
    ) -> Result<u32, SyncError> {
        let fetched = self.remote.fetch_recent(&owner_id, kind, limit).await?;

        let pending: HashSet<RecordId> = self
            .repository
            .all_operations()
            .await?
            .iter()
            .map(|op| *op.record_id())
            .collect();

        let mut applied = 0;
        for remote in fetched {
            if pending.contains(&remote.id) {
                debug!(
                    record_id = %remote.id,
                    "Skipping warm-up for record with queued local mutation"
                );
                continue;
            }

            let existing = self.repository.get_record(&remote.id).await?;
            let created_at = existing
                .as_ref()
                .map(|r| r.created_at())
                .unwrap_or_else(Utc::now);

            let record = ActivityRecord::from_parts(
                remote.id,
                remote.owner_id,
                remote.kind,
                remote.start_time,
                remote.end_time,
                ActivityPayload {
                    notes: remote.notes,
                    fields: remote.fields,
                },
                created_at,
                remote.updated_at,
                true,
                existing.as_ref().map(|r| r.sync_attempts()).unwrap_or(0),
                existing.as_ref().and_then(|r| r.last_sync_attempt()),
            );

            self.repository.save_record(&record).await?;
            applied += 1;
        }

        info!(applied, "Cache warm-up completed");
        Ok(applied)
    }

    // ========================================================================
    // Queue diagnostics
    // ========================================================================

    /// Subscribes to the queued-operation count (exhausted ones included)
    pub fn pending_count_stream(&self) -> watch::Receiver<i64> {
        self.repository.pending_count_stream()
    }

    /// Returns the number of exhausted ("stuck") operations
    pub async fn stuck_operation_count(&self) -> Result<i64, SyncError> {
        Ok(self.repository.exhausted_count().await?)
    }

    /// Re-arms an exhausted operation and requests an immediate drain
    pub async fn retry_operation(&self, operation_id: &OperationId) -> Result<(), SyncError> {
        self.repository.reset_attempts(operation_id).await?;
        self.scheduler.schedule_immediate(true);
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load_record(&self, record_id: &RecordId) -> Result<ActivityRecord, SyncError> {
        self.repository
            .get_record(record_id)
            .await?
            .ok_or_else(|| DomainError::RecordNotFound(record_id.to_string()).into())
    }

    /// The shared write path: local write first, optimistic remote attempt
    /// second, enqueue-on-failure third
    async fn write_through(
        &self,
        mut record: ActivityRecord,
        kind: OperationKind,
        update: FieldUpdate,
    ) -> Result<ActivityRecord, SyncError> {
        if !self.monitor.is_available() {
            // Offline: one transaction covers the record and its queued
            // operation, so neither can exist without the other.
            let operation = self.build_operation(&record, kind, &update)?;
            self.repository
                .save_record_with_operation(&record, Some(&operation))
                .await?;

            debug!(
                record_id = %record.id(),
                operation = %kind,
                "Offline write queued"
            );
            self.scheduler.schedule_immediate(true);
            return Ok(record);
        }

        // Online: make the record durable before any remote traffic
        self.repository.save_record(&record).await?;

        record.record_sync_attempt(Utc::now());
        match self.attempt_remote(&record, kind, &update).await {
            Ok(()) => {
                record.mark_synced();
                self.repository.save_record(&record).await?;
                debug!(
                    record_id = %record.id(),
                    operation = %kind,
                    "Write mirrored remotely"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(
                    record_id = %record.id(),
                    operation = %kind,
                    error = %err,
                    "Immediate remote attempt failed, queueing operation"
                );

                let operation = self.build_operation(&record, kind, &update)?;
                self.repository
                    .save_record_with_operation(&record, Some(&operation))
                    .await?;
                self.scheduler.schedule_immediate(true);
                Ok(record)
            }
        }
    }

    fn build_operation(
        &self,
        record: &ActivityRecord,
        kind: OperationKind,
        update: &FieldUpdate,
    ) -> Result<SyncOperation, SyncError> {
        SyncOperation::new(kind, *record.id(), *record.owner_id(), update).map_err(|e| {
            SyncError::Storage(anyhow::anyhow!("Failed to encode operation payload: {e}"))
        })
    }

    async fn attempt_remote(
        &self,
        record: &ActivityRecord,
        kind: OperationKind,
        update: &FieldUpdate,
    ) -> Result<(), RemoteError> {
        match kind {
            OperationKind::Create => {
                self.remote.create_record(record).await?;
            }
            OperationKind::End => {
                let end_time = update.end_time.ok_or_else(|| {
                    RemoteError::InvalidPayload("end operation without end time".to_string())
                })?;
                self.remote
                    .end_record(record.id(), record.owner_id(), end_time)
                    .await?;
            }
            OperationKind::Update
            | OperationKind::UpdateStartTime
            | OperationKind::UpdateTimes
            | OperationKind::UpdateNotes => {
                self.remote
                    .update_record(record.id(), record.owner_id(), update)
                    .await?;
            }
        }
        Ok(())
    }

    async fn start_timer(&self, record: &ActivityRecord) {
        let key = (*record.owner_id(), record.kind());
        let timer = ElapsedTimer::start(record.start_time(), TIMER_TICK, &self.timer_root);

        // Replacing an entry drops (and thereby cancels) the old timer, so
        // a superseded record never keeps one running.
        self.timers.lock().await.insert(key, timer);
    }

    async fn cancel_timer(&self, owner_id: &OwnerId, kind: ActivityKind) {
        if let Some(timer) = self.timers.lock().await.remove(&(*owner_id, kind)) {
            timer.cancel();
        }
    }
}
