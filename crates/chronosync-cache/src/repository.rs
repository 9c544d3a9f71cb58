//! SQLite implementation of IStateRepository
//!
//! This module provides the concrete SQLite-based implementation of the
//! state repository port defined in chronosync-core. It handles all domain
//! type serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type               | SQL Type | Strategy                      |
//! |---------------------------|----------|-------------------------------|
//! | RecordId, OwnerId, OperationId | TEXT | UUID string via `.to_string()` / `FromStr` |
//! | ActivityKind, OperationKind    | TEXT | snake_case via `.as_str()` / `parse()` |
//! | DateTime<Utc>             | TEXT     | RFC 3339 with fixed-width microseconds, so lexicographic ordering matches chronological ordering |
//! | ActivityPayload.fields    | TEXT     | serde_json serialization (NULL when absent) |
//! | synced                    | INTEGER  | 0 / 1                         |
//!
//! ## Change notification
//!
//! The repository owns a broadcast channel for record changes and a watch
//! channel for the queue depth. Both are process-local; the watch channel
//! is primed from a COUNT query at construction so a restarted process
//! observes the carried-over queue immediately.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, watch};

use chronosync_core::domain::{
    activity::{ActivityKind, ActivityPayload, ActivityRecord},
    newtypes::{OperationId, OwnerId, RecordId},
    operation::{OperationKind, SyncOperation},
};
use chronosync_core::ports::IStateRepository;

use crate::CacheError;

/// Capacity of the record change feed; a slow subscriber that lags simply
/// re-reads instead of blocking writers.
const CHANGE_FEED_CAPACITY: usize = 256;

/// SQLite-based implementation of the state repository port
///
/// Provides persistent storage for activity records and the sync queue.
/// All operations are performed through a connection pool for concurrency.
pub struct SqliteStateRepository {
    pool: SqlitePool,
    changes: broadcast::Sender<ActivityRecord>,
    pending: watch::Sender<i64>,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    ///
    /// Primes the pending-count stream from the persisted queue so that
    /// operations surviving a process restart are visible to subscribers
    /// without waiting for the first mutation.
    pub async fn new(pool: SqlitePool) -> Result<Self, CacheError> {
        let count = count_queue(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (pending, _) = watch::channel(count);

        Ok(Self {
            pool,
            changes,
            pending,
        })
    }

    /// Publishes a record to the change feed (no-op without subscribers)
    fn publish_change(&self, record: &ActivityRecord) {
        let _ = self.changes.send(record.clone());
    }

    /// Re-counts the queue and updates the pending-count stream
    async fn refresh_pending(&self) -> Result<(), CacheError> {
        let count = count_queue(&self.pool).await?;
        self.pending.send_replace(count);
        Ok(())
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Formats a timestamp for storage
///
/// Fixed-width microseconds and a `Z` suffix keep the TEXT column's
/// lexicographic ordering identical to chronological ordering, which the
/// range and FIFO queries rely on.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_optional_datetime(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(fmt_datetime)
}

/// Parse a DateTime<Utc> from its stored representation
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

async fn count_queue(pool: &SqlitePool) -> Result<i64, CacheError> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await
        .map_err(CacheError::from)
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Reconstruct an ActivityRecord from a database row
fn record_from_row(row: &SqliteRow) -> Result<ActivityRecord, CacheError> {
    let id_str: String = row.get("id");
    let owner_id_str: String = row.get("owner_id");
    let kind_str: String = row.get("kind");
    let start_time_str: String = row.get("start_time");
    let end_time_str: Option<String> = row.get("end_time");
    let notes: Option<String> = row.get("notes");
    let fields_str: Option<String> = row.get("fields");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");
    let synced: i64 = row.get("synced");
    let sync_attempts: i64 = row.get("sync_attempts");
    let last_sync_attempt_str: Option<String> = row.get("last_sync_attempt");

    let id = RecordId::from_str(&id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid RecordId '{}': {}", id_str, e))
    })?;
    let owner_id = OwnerId::from_str(&owner_id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid OwnerId '{}': {}", owner_id_str, e))
    })?;
    let kind = ActivityKind::parse(&kind_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid kind '{}': {}", kind_str, e))
    })?;

    let fields = match fields_str {
        Some(ref s) if !s.is_empty() => serde_json::from_str(s).map_err(|e| {
            CacheError::SerializationError(format!("Invalid fields JSON: {}", e))
        })?,
        _ => serde_json::Value::Null,
    };

    Ok(ActivityRecord::from_parts(
        id,
        owner_id,
        kind,
        parse_datetime(&start_time_str)?,
        parse_optional_datetime(end_time_str)?,
        ActivityPayload { notes, fields },
        parse_datetime(&created_at_str)?,
        parse_datetime(&updated_at_str)?,
        synced != 0,
        sync_attempts as u32,
        parse_optional_datetime(last_sync_attempt_str)?,
    ))
}

/// Reconstruct a SyncOperation from a database row
fn operation_from_row(row: &SqliteRow) -> Result<SyncOperation, CacheError> {
    let id_str: String = row.get("id");
    let kind_str: String = row.get("kind");
    let record_id_str: String = row.get("record_id");
    let owner_id_str: String = row.get("owner_id");
    let payload: String = row.get("payload");
    let created_at_str: String = row.get("created_at");
    let attempts: i64 = row.get("attempts");
    let last_attempt_str: Option<String> = row.get("last_attempt");
    let max_retries: i64 = row.get("max_retries");

    let id = OperationId::from_str(&id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid OperationId '{}': {}", id_str, e))
    })?;
    let kind = OperationKind::parse(&kind_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid operation kind '{}': {}", kind_str, e))
    })?;
    let record_id = RecordId::from_str(&record_id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid RecordId '{}': {}", record_id_str, e))
    })?;
    let owner_id = OwnerId::from_str(&owner_id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid OwnerId '{}': {}", owner_id_str, e))
    })?;

    Ok(SyncOperation::from_parts(
        id,
        kind,
        record_id,
        owner_id,
        payload,
        parse_datetime(&created_at_str)?,
        attempts as u32,
        parse_optional_datetime(last_attempt_str)?,
        max_retries as u32,
    ))
}

// ============================================================================
// Bind-ready row structs
// ============================================================================

/// Owned column values for an activities upsert
struct ActivityRow {
    id: String,
    owner_id: String,
    kind: String,
    start_time: String,
    end_time: Option<String>,
    notes: Option<String>,
    fields: Option<String>,
    created_at: String,
    updated_at: String,
    synced: i64,
    sync_attempts: i64,
    last_sync_attempt: Option<String>,
}

fn activity_to_row(record: &ActivityRecord) -> Result<ActivityRow, CacheError> {
    let fields = if record.payload().fields.is_null() {
        None
    } else {
        Some(serde_json::to_string(&record.payload().fields).map_err(|e| {
            CacheError::SerializationError(format!("Failed to serialize fields: {}", e))
        })?)
    };

    Ok(ActivityRow {
        id: record.id().to_string(),
        owner_id: record.owner_id().to_string(),
        kind: record.kind().as_str().to_string(),
        start_time: fmt_datetime(record.start_time()),
        end_time: fmt_optional_datetime(record.end_time()),
        notes: record.payload().notes.clone(),
        fields,
        created_at: fmt_datetime(record.created_at()),
        updated_at: fmt_datetime(record.updated_at()),
        synced: i64::from(record.is_synced()),
        sync_attempts: i64::from(record.sync_attempts()),
        last_sync_attempt: fmt_optional_datetime(record.last_sync_attempt()),
    })
}

/// Owned column values for a sync_queue insert
struct OperationRow {
    id: String,
    kind: String,
    record_id: String,
    owner_id: String,
    payload: String,
    created_at: String,
    attempts: i64,
    last_attempt: Option<String>,
    max_retries: i64,
}

fn operation_to_row(operation: &SyncOperation) -> OperationRow {
    OperationRow {
        id: operation.id().to_string(),
        kind: operation.kind().as_str().to_string(),
        record_id: operation.record_id().to_string(),
        owner_id: operation.owner_id().to_string(),
        payload: operation.payload().to_string(),
        created_at: fmt_datetime(operation.created_at()),
        attempts: i64::from(operation.attempts()),
        last_attempt: fmt_optional_datetime(operation.last_attempt()),
        max_retries: i64::from(operation.max_retries()),
    }
}

// ============================================================================
// SQL statements
// ============================================================================

const UPSERT_ACTIVITY_SQL: &str = r#"
INSERT INTO activities (
    id, owner_id, kind, start_time, end_time, notes, fields,
    created_at, updated_at, synced, sync_attempts, last_sync_attempt
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(id) DO UPDATE SET
    owner_id = excluded.owner_id,
    kind = excluded.kind,
    start_time = excluded.start_time,
    end_time = excluded.end_time,
    notes = excluded.notes,
    fields = excluded.fields,
    updated_at = excluded.updated_at,
    synced = excluded.synced,
    sync_attempts = excluded.sync_attempts,
    last_sync_attempt = excluded.last_sync_attempt
"#;

const INSERT_OPERATION_SQL: &str = r#"
INSERT INTO sync_queue (
    id, kind, record_id, owner_id, payload,
    created_at, attempts, last_attempt, max_retries
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#;

// ============================================================================
// IStateRepository implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateRepository for SqliteStateRepository {
    // --- Activity record operations ---

    async fn save_record(&self, record: &ActivityRecord) -> anyhow::Result<()> {
        let row = activity_to_row(record)?;

        sqlx::query(UPSERT_ACTIVITY_SQL)
            .bind(row.id)
            .bind(row.owner_id)
            .bind(row.kind)
            .bind(row.start_time)
            .bind(row.end_time)
            .bind(row.notes)
            .bind(row.fields)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.synced)
            .bind(row.sync_attempts)
            .bind(row.last_sync_attempt)
            .execute(&self.pool)
            .await
            .map_err(CacheError::from)?;

        self.publish_change(record);
        Ok(())
    }

    async fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<ActivityRecord>> {
        let row = sqlx::query("SELECT * FROM activities WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;

        row.as_ref().map(record_from_row).transpose().map_err(Into::into)
    }

    async fn get_ongoing(
        &self,
        owner_id: &OwnerId,
        kind: ActivityKind,
    ) -> anyhow::Result<Option<ActivityRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE owner_id = ?1 AND kind = ?2 AND end_time IS NULL
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(CacheError::from)?;

        row.as_ref().map(record_from_row).transpose().map_err(Into::into)
    }

    async fn get_last_completed(
        &self,
        owner_id: &OwnerId,
        kind: ActivityKind,
    ) -> anyhow::Result<Option<ActivityRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM activities
            WHERE owner_id = ?1 AND kind = ?2 AND end_time IS NOT NULL
            ORDER BY end_time DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(CacheError::from)?;

        row.as_ref().map(record_from_row).transpose().map_err(Into::into)
    }

    async fn query_range(
        &self,
        owner_id: &OwnerId,
        kind: Option<ActivityKind>,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ActivityRecord>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r#"
                    SELECT * FROM activities
                    WHERE owner_id = ?1 AND kind = ?2
                      AND start_time >= ?3 AND start_time <= ?4
                    ORDER BY start_time ASC
                    "#,
                )
                .bind(owner_id.to_string())
                .bind(kind.as_str())
                .bind(fmt_datetime(from))
                .bind(fmt_datetime(until))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM activities
                    WHERE owner_id = ?1
                      AND start_time >= ?2 AND start_time <= ?3
                    ORDER BY start_time ASC
                    "#,
                )
                .bind(owner_id.to_string())
                .bind(fmt_datetime(from))
                .bind(fmt_datetime(until))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(CacheError::from)?;

        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.changes.subscribe()
    }

    // --- Sync queue operations ---

    async fn enqueue(&self, operation: &SyncOperation) -> anyhow::Result<()> {
        let row = operation_to_row(operation);

        sqlx::query(INSERT_OPERATION_SQL)
            .bind(row.id)
            .bind(row.kind)
            .bind(row.record_id)
            .bind(row.owner_id)
            .bind(row.payload)
            .bind(row.created_at)
            .bind(row.attempts)
            .bind(row.last_attempt)
            .bind(row.max_retries)
            .execute(&self.pool)
            .await
            .map_err(CacheError::from)?;

        self.refresh_pending().await?;
        Ok(())
    }

    async fn retryable_operations(&self) -> anyhow::Result<Vec<SyncOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sync_queue
            WHERE attempts < max_retries
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(CacheError::from)?;

        rows.iter()
            .map(operation_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn all_operations(&self) -> anyhow::Result<Vec<SyncOperation>> {
        let rows = sqlx::query("SELECT * FROM sync_queue ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(CacheError::from)?;

        rows.iter()
            .map(operation_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    async fn delete_operation(&self, id: &OperationId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(CacheError::from)?;

        self.refresh_pending().await?;
        Ok(())
    }

    async fn record_attempt(&self, id: &OperationId, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET attempts = attempts + 1, last_attempt = ?1
            WHERE id = ?2
            "#,
        )
        .bind(fmt_datetime(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;

        Ok(())
    }

    async fn reset_attempts(&self, id: &OperationId) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET attempts = 0, last_attempt = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;

        Ok(())
    }

    async fn pending_count(&self) -> anyhow::Result<i64> {
        count_queue(&self.pool).await.map_err(Into::into)
    }

    fn pending_count_stream(&self) -> watch::Receiver<i64> {
        self.pending.subscribe()
    }

    async fn exhausted_count(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_queue WHERE attempts >= max_retries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(CacheError::from)
        .map_err(Into::into)
    }

    // --- Transactional operations ---

    async fn save_record_with_operation(
        &self,
        record: &ActivityRecord,
        operation: Option<&SyncOperation>,
    ) -> anyhow::Result<()> {
        let activity_row = activity_to_row(record)?;
        let operation_row = operation.map(operation_to_row);

        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;

        sqlx::query(UPSERT_ACTIVITY_SQL)
            .bind(activity_row.id)
            .bind(activity_row.owner_id)
            .bind(activity_row.kind)
            .bind(activity_row.start_time)
            .bind(activity_row.end_time)
            .bind(activity_row.notes)
            .bind(activity_row.fields)
            .bind(activity_row.created_at)
            .bind(activity_row.updated_at)
            .bind(activity_row.synced)
            .bind(activity_row.sync_attempts)
            .bind(activity_row.last_sync_attempt)
            .execute(&mut *tx)
            .await
            .map_err(CacheError::from)?;

        if let Some(row) = operation_row {
            sqlx::query(INSERT_OPERATION_SQL)
                .bind(row.id)
                .bind(row.kind)
                .bind(row.record_id)
                .bind(row.owner_id)
                .bind(row.payload)
                .bind(row.created_at)
                .bind(row.attempts)
                .bind(row.last_attempt)
                .bind(row.max_retries)
                .execute(&mut *tx)
                .await
                .map_err(CacheError::from)?;
        }

        tx.commit().await.map_err(CacheError::from)?;

        self.publish_change(record);
        if operation.is_some() {
            self.refresh_pending().await?;
        }
        Ok(())
    }
}
