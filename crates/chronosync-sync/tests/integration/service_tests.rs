//! Orchestrator integration tests
//!
//! Cover the local-first write paths, the ongoing invariant, tri-state
//! reads, cache warm-up, diagnostics, and the offline-to-online scenario
//! end to end, including durability across a simulated process restart.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use chronosync_cache::{DatabasePool, SqliteStateRepository};
use chronosync_core::domain::{
    activity::{ActivityKind, ActivityPayload, ActivityRecord},
    errors::DomainError,
    newtypes::OwnerId,
    operation::{OperationKind, DEFAULT_MAX_RETRIES},
};
use chronosync_core::ports::{
    connectivity::ConnectivityStatus, IRemoteClient, IStateRepository,
};
use chronosync_sync::service::QueryResult;
use chronosync_sync::SyncError;

use crate::common::Harness;

// ============================================================================
// Write paths
// ============================================================================

#[tokio::test]
async fn test_offline_start_persists_locally_and_queues_create() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    let record = h
        .service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    // The caller gets the record back synchronously, offline-qualified
    assert!(record.is_ongoing());
    assert!(!record.is_synced());
    assert_eq!(h.remote.mutation_calls(), 0);

    let stored = h.repository.get_record(record.id()).await.unwrap().unwrap();
    assert_eq!(stored.id(), record.id());

    let ops = h.repository.all_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OperationKind::Create);
    assert_eq!(ops[0].record_id(), record.id());

    // The write asked for a drain as soon as the network allows
    assert_eq!(h.scheduler.immediate_requests(), 1);
}

#[tokio::test]
async fn test_online_start_syncs_immediately_without_queueing() {
    let h = Harness::new(true).await;
    let owner = OwnerId::new();

    let record = h
        .service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    assert!(record.is_synced());
    assert!(h.remote.get(record.id()).is_some());
    assert_eq!(h.repository.pending_count().await.unwrap(), 0);
    assert_eq!(h.scheduler.immediate_requests(), 0);
}

#[tokio::test]
async fn test_online_start_with_remote_failure_queues_create() {
    let h = Harness::new(true).await;
    h.remote.fail_next(1);

    let record = h
        .service
        .start_activity(
            OwnerId::new(),
            ActivityKind::Feeding,
            Utc::now(),
            ActivityPayload::new(),
        )
        .await
        .unwrap();

    // The write still succeeds from the caller's point of view
    assert!(!record.is_synced());
    assert_eq!(record.sync_attempts(), 1);

    let ops = h.repository.all_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind(), OperationKind::Create);
    assert_eq!(h.scheduler.immediate_requests(), 1);
}

#[tokio::test]
async fn test_ongoing_invariant_rejects_second_start() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    h.service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    let result = h
        .service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Domain(DomainError::OngoingActivityExists { .. }))
    ));
    // The violation is synchronous and nothing extra was queued
    assert_eq!(h.repository.pending_count().await.unwrap(), 1);

    // A different kind for the same owner is unaffected
    h.service
        .start_activity(owner, ActivityKind::Feeding, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    // As is the same kind for a different owner
    h.service
        .start_activity(
            OwnerId::new(),
            ActivityKind::Sleep,
            Utc::now(),
            ActivityPayload::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_end_without_ongoing_is_rejected() {
    let h = Harness::new(false).await;

    let result = h
        .service
        .end_activity(OwnerId::new(), ActivityKind::Sleep, Utc::now())
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Domain(DomainError::NoOngoingActivity { .. }))
    ));
    assert_eq!(h.repository.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_instant_activity_skips_ongoing_invariant() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    h.service
        .log_instant_activity(
            owner,
            ActivityKind::Medication,
            Utc::now(),
            ActivityPayload::with_notes("5ml"),
        )
        .await
        .unwrap();

    // An instant record is never ongoing, so a timed activity of the same
    // kind can still start
    let record = h
        .service
        .start_activity(owner, ActivityKind::Medication, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();
    assert!(record.is_ongoing());
}

#[tokio::test]
async fn test_offline_updates_queue_matching_operations() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let start = Utc::now() - Duration::hours(1);

    let record = h
        .service
        .start_activity(owner, ActivityKind::Sleep, start, ActivityPayload::new())
        .await
        .unwrap();

    h.service
        .update_notes(record.id(), Some("restless".to_string()))
        .await
        .unwrap();
    h.service
        .update_start_time(record.id(), start - Duration::minutes(10))
        .await
        .unwrap();

    let ops = h.repository.all_operations().await.unwrap();
    let kinds: Vec<_> = ops.iter().map(|op| op.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::Create,
            OperationKind::UpdateNotes,
            OperationKind::UpdateStartTime
        ]
    );

    // The captured payload carries the authoritative values
    let decoded = ops[1].decode_payload().unwrap();
    assert_eq!(decoded.notes.as_deref(), Some("restless"));
}

#[tokio::test]
async fn test_update_times_validates_order() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let start = Utc::now();

    let record = h
        .service
        .start_activity(owner, ActivityKind::Play, start, ActivityPayload::new())
        .await
        .unwrap();

    let result = h
        .service
        .update_times(record.id(), start, start - Duration::minutes(5))
        .await;

    assert!(matches!(
        result,
        Err(SyncError::Domain(DomainError::ValidationFailed(_)))
    ));
    // Only the original Create is queued
    assert_eq!(h.repository.pending_count().await.unwrap(), 1);
}

// ============================================================================
// The offline-to-online scenario, end to end
// ============================================================================

#[tokio::test]
async fn test_offline_start_and_end_then_reconnect() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2026, 3, 14, 10, 20, 0).unwrap();

    // Start a timed activity at 10:00 while offline
    let record = h
        .service
        .start_activity(owner, ActivityKind::Sleep, start, ActivityPayload::new())
        .await
        .unwrap();
    assert_eq!(record.start_time(), start);
    assert!(record.is_ongoing());
    assert!(!record.is_synced());

    // End it at 10:20, still offline
    let record = h.service.end_activity(owner, ActivityKind::Sleep, end).await.unwrap();
    assert_eq!(record.end_time(), Some(end));
    assert!(!record.is_synced());

    // Queue holds [Create, End] in creation order
    let ops = h.repository.all_operations().await.unwrap();
    let kinds: Vec<_> = ops.iter().map(|op| op.kind()).collect();
    assert_eq!(kinds, vec![OperationKind::Create, OperationKind::End]);

    // Connectivity returns; a drain replays both in order
    h.handle.set_available(true);
    let replayed = h.drain_to_quiescence().await;
    assert_eq!(replayed, 2);

    assert_eq!(h.repository.pending_count().await.unwrap(), 0);
    let local = h.repository.get_record(record.id()).await.unwrap().unwrap();
    assert!(local.is_synced());

    let remote = h.remote.get(record.id()).unwrap();
    assert_eq!(remote.start_time, start);
    assert_eq!(remote.end_time, Some(end));
}

#[tokio::test]
async fn test_eventual_consistency_across_owners_and_kinds() {
    let h = Harness::new(false).await;
    let first = OwnerId::new();
    let second = OwnerId::new();
    let base = Utc::now() - Duration::hours(2);

    let mut ids = Vec::new();
    for (owner, kind) in [
        (first, ActivityKind::Sleep),
        (first, ActivityKind::Feeding),
        (second, ActivityKind::Sleep),
    ] {
        let record = h
            .service
            .start_activity(owner, kind, base, ActivityPayload::new())
            .await
            .unwrap();
        ids.push(*record.id());
    }
    h.service
        .end_activity(first, ActivityKind::Feeding, base + Duration::minutes(30))
        .await
        .unwrap();

    assert_eq!(h.repository.pending_count().await.unwrap(), 4);

    h.handle.set_available(true);
    let replayed = h.drain_to_quiescence().await;
    assert_eq!(replayed, 4);

    assert_eq!(h.repository.pending_count().await.unwrap(), 0);
    for id in &ids {
        assert!(h.repository.get_record(id).await.unwrap().unwrap().is_synced());
        assert!(h.remote.get(id).is_some());
    }
}

#[tokio::test]
async fn test_queue_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("chronosync.db");
    let owner = OwnerId::new();

    // First "process": write while offline, then go away
    let record_id = {
        let pool = DatabasePool::new(&db_path).await.unwrap();
        let repository = Arc::new(SqliteStateRepository::new(pool.pool().clone()).await.unwrap());
        let h = Harness::over_repository(repository, false);

        let record = h
            .service
            .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
            .await
            .unwrap();
        *record.id()
    };

    // Second "process": the carried-over queue is visible immediately and
    // drains once the network is there
    let pool = DatabasePool::new(&db_path).await.unwrap();
    let repository = Arc::new(SqliteStateRepository::new(pool.pool().clone()).await.unwrap());
    let h = Harness::over_repository(repository, true);

    assert_eq!(*h.repository.pending_count_stream().borrow(), 1);

    let replayed = h.drain_to_quiescence().await;
    assert_eq!(replayed, 1);

    let local = h.repository.get_record(&record_id).await.unwrap().unwrap();
    assert!(local.is_synced());
    assert!(h.remote.get(&record_id).is_some());
}

// ============================================================================
// Read paths
// ============================================================================

#[tokio::test]
async fn test_ongoing_stream_is_local_first() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let mut stream = h.service.ongoing(owner, ActivityKind::Sleep).await;

    // Initial read: nothing locally, and that is reported even offline
    let query = stream.next().await.unwrap();
    assert_eq!(query.result, QueryResult::Empty);
    assert_eq!(query.connectivity, ConnectivityStatus::Unavailable);

    // A matching write wakes the stream; local data is never withheld
    // just because the network is down
    let record = h
        .service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    let query = stream.next().await.unwrap();
    match query.result {
        QueryResult::Found(found) => assert_eq!(found.id(), record.id()),
        other => panic!("expected Found, got {other:?}"),
    }
    assert_eq!(query.connectivity, ConnectivityStatus::Unavailable);

    // Ending the activity empties the ongoing slot
    h.service
        .end_activity(owner, ActivityKind::Sleep, Utc::now())
        .await
        .unwrap();

    let query = stream.next().await.unwrap();
    assert_eq!(query.result, QueryResult::Empty);
}

#[tokio::test]
async fn test_stream_reemits_on_connectivity_transition() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let mut stream = h.service.ongoing(owner, ActivityKind::Sleep).await;

    let query = stream.next().await.unwrap();
    assert_eq!(query.connectivity, ConnectivityStatus::Unavailable);

    h.handle.set_available(true);

    let query = stream.next().await.unwrap();
    assert_eq!(query.connectivity, ConnectivityStatus::Available);
    // Still the same local answer
    assert_eq!(query.result, QueryResult::Empty);
}

#[tokio::test]
async fn test_last_completed_stream() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();
    let base = Utc::now() - Duration::hours(3);

    let record = h
        .service
        .start_activity(owner, ActivityKind::Feeding, base, ActivityPayload::new())
        .await
        .unwrap();
    h.service
        .end_activity(owner, ActivityKind::Feeding, base + Duration::minutes(20))
        .await
        .unwrap();

    let mut stream = h.service.last_completed(owner, ActivityKind::Feeding).await;
    let query = stream.next().await.unwrap();
    match query.result {
        QueryResult::Found(found) => {
            assert_eq!(found.id(), record.id());
            assert!(!found.is_ongoing());
        }
        other => panic!("expected Found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_elapsed_timer_lifecycle() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    assert!(h.service.elapsed(owner, ActivityKind::Sleep).await.is_none());

    h.service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();
    assert!(h.service.elapsed(owner, ActivityKind::Sleep).await.is_some());

    // Ending the activity tears the timer down
    h.service
        .end_activity(owner, ActivityKind::Sleep, Utc::now())
        .await
        .unwrap();
    assert!(h.service.elapsed(owner, ActivityKind::Sleep).await.is_none());
}

// ============================================================================
// Cache warm-up
// ============================================================================

#[tokio::test]
async fn test_refresh_recent_skips_records_with_queued_mutations() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    // A local offline write with its Create still queued
    let dirty = h
        .service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    // The remote knows about the dirty record (an older copy) and about a
    // record this device has never seen
    let stale_copy = ActivityRecord::from_parts(
        *dirty.id(),
        owner,
        ActivityKind::Sleep,
        dirty.start_time() - Duration::hours(1),
        None,
        ActivityPayload::new(),
        Utc::now(),
        Utc::now(),
        false,
        0,
        None,
    );
    h.remote.create_record(&stale_copy).await.unwrap();

    let foreign = ActivityRecord::instant(
        owner,
        ActivityKind::Medication,
        Utc::now() - Duration::hours(2),
        ActivityPayload::with_notes("5ml"),
    );
    h.remote.create_record(&foreign).await.unwrap();

    let applied = h.service.refresh_recent(owner, None, 10).await.unwrap();

    // Only the foreign record was applied; the queued local mutation
    // outranks the remote copy
    assert_eq!(applied, 1);
    let local_dirty = h.repository.get_record(dirty.id()).await.unwrap().unwrap();
    assert_eq!(local_dirty.start_time(), dirty.start_time());
    assert!(!local_dirty.is_synced());

    let warmed = h.repository.get_record(foreign.id()).await.unwrap().unwrap();
    assert!(warmed.is_synced());
    assert_eq!(warmed.payload().notes.as_deref(), Some("5ml"));
}

// ============================================================================
// Diagnostics
// ============================================================================

#[tokio::test]
async fn test_stuck_count_and_manual_retry() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    h.service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();

    let ops = h.repository.all_operations().await.unwrap();
    let op_id = *ops[0].id();
    for _ in 0..DEFAULT_MAX_RETRIES {
        h.repository.record_attempt(&op_id, Utc::now()).await.unwrap();
    }

    assert_eq!(h.service.stuck_operation_count().await.unwrap(), 1);
    assert!(h.repository.retryable_operations().await.unwrap().is_empty());

    let before = h.scheduler.immediate_requests();
    h.service.retry_operation(&op_id).await.unwrap();

    // Re-armed and a drain was requested
    assert_eq!(h.service.stuck_operation_count().await.unwrap(), 0);
    assert_eq!(h.repository.retryable_operations().await.unwrap().len(), 1);
    assert_eq!(h.scheduler.immediate_requests(), before + 1);
}

#[tokio::test]
async fn test_init_schedules_periodic_and_startup_drain() {
    let h = Harness::new(true).await;

    h.service.init(std::time::Duration::from_secs(300));

    assert_eq!(h.scheduler.periodic_requests(), 1);
    // Startup requests an immediate drain to flush any carried-over queue
    assert_eq!(h.scheduler.immediate_requests(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_triggers_and_timers() {
    let h = Harness::new(false).await;
    let owner = OwnerId::new();

    h.service
        .start_activity(owner, ActivityKind::Sleep, Utc::now(), ActivityPayload::new())
        .await
        .unwrap();
    assert!(h.service.elapsed(owner, ActivityKind::Sleep).await.is_some());

    h.service.shutdown().await;

    assert!(h.scheduler.is_cancelled());
    assert!(h.service.elapsed(owner, ActivityKind::Sleep).await.is_none());
}
