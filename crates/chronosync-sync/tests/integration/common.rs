//! Shared fixtures for the sync integration tests
//!
//! Provides a [`Harness`] that wires the orchestrator and dispatcher to a
//! real in-memory SQLite repository, a scriptable remote client, and a
//! manually driven connectivity monitor.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use chronosync_cache::{DatabasePool, SqliteStateRepository};
use chronosync_core::domain::{
    activity::{ActivityKind, ActivityRecord},
    newtypes::{OwnerId, RecordId},
    operation::FieldUpdate,
};
use chronosync_core::ports::{
    IConnectivityMonitor, IRemoteClient, IStateRepository, ISyncScheduler, RemoteError,
    RemoteRecord,
};
use chronosync_sync::connectivity::{ChannelConnectivityMonitor, ConnectivityHandle};
use chronosync_sync::dispatcher::SyncDispatcher;
use chronosync_sync::remote::LoopbackRemoteClient;
use chronosync_sync::service::OfflineActivityService;

// ============================================================================
// Scriptable remote client
// ============================================================================

/// Pauses a remote call mid-flight so a test can observe overlap
pub struct Gate {
    /// Signalled when a call has entered the remote
    pub entered: Arc<Notify>,
    /// Signalled by the test to let the call proceed
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

/// Remote client whose failures can be scripted per test
///
/// Delegates to a [`LoopbackRemoteClient`] for the happy path, so remote
/// state assertions (idempotent creates, applied updates) run against the
/// same contract a real adapter must honor.
pub struct ScriptedRemote {
    delegate: LoopbackRemoteClient,
    fail_remaining: AtomicU32,
    reject_remaining: AtomicU32,
    mutation_calls: AtomicU32,
    gate: Mutex<Option<Gate>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            delegate: LoopbackRemoteClient::new(),
            fail_remaining: AtomicU32::new(0),
            reject_remaining: AtomicU32::new(0),
            mutation_calls: AtomicU32::new(0),
            gate: Mutex::new(None),
        }
    }

    /// The next `count` mutation calls fail with `RemoteError::Unavailable`
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// The next `count` mutation calls fail with `RemoteError::InvalidPayload`
    pub fn reject_next(&self, count: u32) {
        self.reject_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of create/end/update calls made so far
    pub fn mutation_calls(&self) -> u32 {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    /// Installs a gate: the next mutation call blocks until released
    pub fn install_gate(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = Gate::new();
        let handles = (Arc::clone(&gate.entered), Arc::clone(&gate.release));
        *self.gate.lock().unwrap() = Some(gate);
        handles
    }

    /// Snapshot of a remotely stored record
    pub fn get(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.delegate.get(id)
    }

    /// Number of remotely stored records
    pub fn len(&self) -> usize {
        self.delegate.len()
    }

    async fn before_mutation(&self) -> Result<(), RemoteError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if decrement(&self.fail_remaining) {
            return Err(RemoteError::Unavailable("scripted failure".to_string()));
        }
        if decrement(&self.reject_remaining) {
            return Err(RemoteError::InvalidPayload("scripted rejection".to_string()));
        }
        Ok(())
    }
}

fn decrement(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl IRemoteClient for ScriptedRemote {
    async fn create_record(&self, record: &ActivityRecord) -> Result<RemoteRecord, RemoteError> {
        self.before_mutation().await?;
        self.delegate.create_record(record).await
    }

    async fn end_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        end_time: DateTime<Utc>,
    ) -> Result<RemoteRecord, RemoteError> {
        self.before_mutation().await?;
        self.delegate.end_record(record_id, owner_id, end_time).await
    }

    async fn update_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        update: &FieldUpdate,
    ) -> Result<RemoteRecord, RemoteError> {
        self.before_mutation().await?;
        self.delegate.update_record(record_id, owner_id, update).await
    }

    async fn fetch_recent(
        &self,
        owner_id: &OwnerId,
        kind: Option<ActivityKind>,
        limit: u32,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.delegate.fetch_recent(owner_id, kind, limit).await
    }
}

// ============================================================================
// Recording scheduler
// ============================================================================

/// Scheduler stub that records trigger requests instead of spawning tasks
///
/// The tests drive the dispatcher directly; this only verifies that the
/// orchestrator requests drains at the right moments.
#[derive(Default)]
pub struct RecordingScheduler {
    immediate_requests: AtomicU32,
    periodic_requests: AtomicU32,
    cancelled: AtomicBool,
}

impl RecordingScheduler {
    pub fn immediate_requests(&self) -> u32 {
        self.immediate_requests.load(Ordering::SeqCst)
    }

    pub fn periodic_requests(&self) -> u32 {
        self.periodic_requests.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl ISyncScheduler for RecordingScheduler {
    fn schedule_periodic(&self, _min_interval: Duration, _require_network: bool) {
        self.periodic_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn schedule_immediate(&self, _require_network: bool) {
        self.immediate_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Everything a test needs, wired over shared state
pub struct Harness {
    pub repository: Arc<SqliteStateRepository>,
    pub remote: Arc<ScriptedRemote>,
    pub handle: ConnectivityHandle,
    pub scheduler: Arc<RecordingScheduler>,
    pub service: OfflineActivityService,
    pub dispatcher: Arc<SyncDispatcher>,
}

impl Harness {
    pub async fn new(online: bool) -> Self {
        let pool = DatabasePool::in_memory()
            .await
            .expect("Failed to create in-memory database");
        let repository = Arc::new(
            SqliteStateRepository::new(pool.pool().clone())
                .await
                .expect("Failed to create repository"),
        );
        Self::over_repository(repository, online)
    }

    /// Builds a harness over an existing repository (restart scenarios)
    pub fn over_repository(repository: Arc<SqliteStateRepository>, online: bool) -> Self {
        let remote = Arc::new(ScriptedRemote::new());
        let (monitor, handle) = ChannelConnectivityMonitor::new(online);
        let monitor: Arc<dyn IConnectivityMonitor> = Arc::new(monitor);
        let scheduler = Arc::new(RecordingScheduler::default());

        let dispatcher = Arc::new(SyncDispatcher::new(
            Arc::clone(&repository) as Arc<dyn IStateRepository>,
            Arc::clone(&remote) as Arc<dyn IRemoteClient>,
            Arc::clone(&monitor),
        ));

        let service = OfflineActivityService::new(
            Arc::clone(&repository) as Arc<dyn IStateRepository>,
            Arc::clone(&remote) as Arc<dyn IRemoteClient>,
            Arc::clone(&monitor),
            Arc::clone(&scheduler) as Arc<dyn ISyncScheduler>,
        );

        Self {
            repository,
            remote,
            handle,
            scheduler,
            service,
            dispatcher,
        }
    }

    /// Drains the queue repeatedly until nothing retryable is left
    ///
    /// Returns the total number of operations replayed. Gives up after a
    /// bounded number of passes so a stuck test fails instead of hanging.
    pub async fn drain_to_quiescence(&self) -> u32 {
        use chronosync_sync::dispatcher::DispatchOutcome;

        let mut total = 0;
        for _ in 0..10 {
            match self.dispatcher.dispatch().await.expect("dispatch failed") {
                DispatchOutcome::Success { succeeded, failed } => {
                    total += succeeded;
                    if succeeded == 0 && failed == 0 {
                        break;
                    }
                }
                _ => break,
            }
        }
        total
    }
}
