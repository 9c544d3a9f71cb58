//! In-process loopback remote client
//!
//! [`LoopbackRemoteClient`] implements the remote client port against an
//! in-memory map. It is the stand-in adapter used when no real transport
//! is configured (local-only operation of the daemon) and doubles as the
//! happy-path remote in integration tests.
//!
//! It deliberately mirrors the contract a real adapter must honor:
//! creates are upserts keyed by the client-generated record id, ends and
//! updates require the record to exist, and field updates are
//! last-write-wins overwrites.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use chronosync_core::domain::{
    activity::{ActivityKind, ActivityRecord},
    newtypes::{OwnerId, RecordId},
    operation::FieldUpdate,
};
use chronosync_core::ports::{IRemoteClient, RemoteError, RemoteRecord};

/// In-memory implementation of the remote client port
#[derive(Default)]
pub struct LoopbackRemoteClient {
    records: Mutex<HashMap<RecordId, RemoteRecord>>,
}

impl LoopbackRemoteClient {
    /// Creates an empty loopback remote
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of a stored record (test/diagnostic helper)
    pub fn get(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Returns the number of stored records (test/diagnostic helper)
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Returns true when no records are stored
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

fn to_remote(record: &ActivityRecord) -> RemoteRecord {
    RemoteRecord {
        id: *record.id(),
        owner_id: *record.owner_id(),
        kind: record.kind(),
        start_time: record.start_time(),
        end_time: record.end_time(),
        notes: record.payload().notes.clone(),
        fields: record.payload().fields.clone(),
        updated_at: Utc::now(),
    }
}

#[async_trait::async_trait]
impl IRemoteClient for LoopbackRemoteClient {
    async fn create_record(&self, record: &ActivityRecord) -> Result<RemoteRecord, RemoteError> {
        let mut records = self.records.lock().unwrap();

        // Idempotent create: replaying the same client id returns the
        // record already stored instead of duplicating it.
        if let Some(existing) = records.get(record.id()) {
            return Ok(existing.clone());
        }

        let remote = to_remote(record);
        records.insert(remote.id, remote.clone());
        Ok(remote)
    }

    async fn end_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        end_time: DateTime<Utc>,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(record_id)
            .filter(|r| r.owner_id == *owner_id)
            .ok_or_else(|| RemoteError::NotFound(record_id.to_string()))?;

        record.end_time = Some(end_time);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn update_record(
        &self,
        record_id: &RecordId,
        owner_id: &OwnerId,
        update: &FieldUpdate,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(record_id)
            .filter(|r| r.owner_id == *owner_id)
            .ok_or_else(|| RemoteError::NotFound(record_id.to_string()))?;

        if let Some(start_time) = update.start_time {
            record.start_time = start_time;
        }
        if let Some(end_time) = update.end_time {
            record.end_time = Some(end_time);
        }
        if let Some(ref notes) = update.notes {
            record.notes = Some(notes.clone());
        }
        if let Some(ref fields) = update.fields {
            record.fields = fields.clone();
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn fetch_recent(
        &self,
        owner_id: &OwnerId,
        kind: Option<ActivityKind>,
        limit: u32,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let records = self.records.lock().unwrap();
        let mut matching: Vec<RemoteRecord> = records
            .values()
            .filter(|r| r.owner_id == *owner_id)
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matching.truncate(limit as usize);
        Ok(matching)
    }
}
