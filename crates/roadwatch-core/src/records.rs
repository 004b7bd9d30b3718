//! ============================================================================
//! Record Log - Locally captured road observations
//! ============================================================================
//! Each successful lookup can be captured as a [`PendingRecord`] filed under
//! `<prefix>/<YYYY>/<MM>/<DD>/<road>/<HH-MM-SS>_metadata.json`. Capturing is
//! the durable first half of the two-phase save: the record is enqueued and
//! written before `capture` returns. Uploading is the sync coordinator's job.
//! ============================================================================

use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::{DurableStore, Store};
use crate::error::StorageError;
use crate::queue::PendingWriteQueue;
use crate::types::{PendingRecord, PositionFix, RecordPayload, RoadInfo, Telemetry};

/// Root segment of every record path
pub const DEFAULT_RECORD_PREFIX: &str = "Gemini_API_Data";

/// Meta key holding the cached number of captured records
pub const LOG_COUNT_KEY: &str = "log_count";

/// Set once the pending index has been rebuilt from stored records
pub const PENDING_INDEX_MARKER: &str = "migration:pending_index_v1";

const MAX_ROAD_SEGMENT_CHARS: usize = 30;
const UNKNOWN_ROAD_SEGMENT: &str = "Unknown_Location";

/// Folder-safe form of a road name: ASCII alphanumerics kept, everything
/// else replaced with `_`, at most 30 characters.
pub fn sanitize_road_name(road_name: &str) -> String {
    let safe: String = road_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(MAX_ROAD_SEGMENT_CHARS)
        .collect();

    if safe.is_empty() {
        UNKNOWN_ROAD_SEGMENT.to_string()
    } else {
        safe
    }
}

/// Build the record for an observation made at `now`.
/// Date folders and the file name use the local wall clock carried by `now`;
/// the stored timestamp is UTC.
pub fn build_record(
    prefix: &str,
    road: &RoadInfo,
    fix: &PositionFix,
    now: DateTime<FixedOffset>,
) -> PendingRecord {
    let path = format!(
        "{}/{}/{}/",
        prefix,
        now.format("%Y/%m/%d"),
        sanitize_road_name(&road.road_name)
    );
    let filename = format!("{}_metadata.json", now.format("%H-%M-%S"));

    PendingRecord {
        record_id: format!("{}{}", path, filename),
        path,
        filename,
        timestamp: now
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        coordinates: fix.coords,
        context: road.context.clone(),
        accuracy: fix.accuracy,
        synced: false,
        remote_id: None,
        payload: RecordPayload {
            road: road.clone(),
            telemetry: Telemetry {
                bearing: fix.bearing,
                gps_accuracy: fix.accuracy,
                gps_timestamp_ms: now.timestamp_millis(),
            },
        },
    }
}

/// Durable log of captured records plus their pending-upload index
pub struct RecordLog {
    store: DurableStore,
    queue: Arc<PendingWriteQueue>,
    prefix: String,
    // serializes read-modify-write of the cached count
    count_lock: Mutex<()>,
}

impl RecordLog {
    /// Open the log and, once per database, rebuild the pending index from
    /// every stored record that has not been synced yet.
    pub async fn open(
        store: DurableStore,
        queue: Arc<PendingWriteQueue>,
        prefix: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let log = Self {
            store,
            queue,
            prefix: prefix.into(),
            count_lock: Mutex::new(()),
        };
        log.migrate_pending_index().await?;
        Ok(log)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self) -> &Arc<PendingWriteQueue> {
        &self.queue
    }

    async fn migrate_pending_index(&self) -> Result<(), StorageError> {
        if self.store.get(Store::Meta, PENDING_INDEX_MARKER).await?.is_some() {
            return Ok(());
        }

        let unsynced: Vec<String> = self
            .decoded_records()
            .await?
            .into_iter()
            .filter(|record| !record.synced)
            .map(|record| record.record_id)
            .collect();

        let added = self.queue.enqueue_batch(unsynced).await?;
        self.store
            .put(Store::Meta, PENDING_INDEX_MARKER, b"true".to_vec())
            .await?;
        info!("Pending index rebuilt: {} unsynced records found", added);
        Ok(())
    }

    /// Phase one of the two-phase save, stamped with the current local time
    pub async fn capture(
        &self,
        road: &RoadInfo,
        fix: &PositionFix,
    ) -> Result<PendingRecord, StorageError> {
        self.capture_at(road, fix, Local::now().fixed_offset()).await
    }

    /// Add the record to the pending index, then write it, before returning.
    /// A failed write leaves at most an index entry without a record, which
    /// the next drain drops as orphaned.
    pub async fn capture_at(
        &self,
        road: &RoadInfo,
        fix: &PositionFix,
        now: DateTime<FixedOffset>,
    ) -> Result<PendingRecord, StorageError> {
        let record = build_record(&self.prefix, road, fix, now);

        let _guard = self.count_lock.lock().await;
        // counted before the write so a recount cannot include this record
        let count = self.read_count().await?;
        let existed = self.store.get(Store::Records, &record.record_id).await?.is_some();

        self.queue.enqueue(&record.record_id).await?;
        self.put_record(&record).await?;
        if !existed {
            self.store
                .put_json(Store::Meta, LOG_COUNT_KEY, &(count + 1))
                .await?;
        }

        debug!("Saved locally to {}", record.record_id);
        Ok(record)
    }

    /// Load a record; an undecodable one is logged and reported as absent
    pub async fn get(&self, record_id: &str) -> Result<Option<PendingRecord>, StorageError> {
        match self.store.get_json::<PendingRecord>(Store::Records, record_id).await {
            Ok(record) => Ok(record),
            Err(StorageError::Serialization(e)) => {
                warn!("Record {} is corrupt: {}", record_id, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn put_record(&self, record: &PendingRecord) -> Result<(), StorageError> {
        self.store
            .put_json(Store::Records, &record.record_id, record)
            .await
    }

    /// Persist the record as uploaded under `remote_id`
    pub async fn mark_synced(
        &self,
        record: &mut PendingRecord,
        remote_id: String,
    ) -> Result<(), StorageError> {
        record.synced = true;
        record.remote_id = Some(remote_id);
        self.put_record(record).await
    }

    /// Every decodable record, ordered by id
    pub async fn list_records(&self) -> Result<Vec<PendingRecord>, StorageError> {
        self.decoded_records().await
    }

    async fn decoded_records(&self) -> Result<Vec<PendingRecord>, StorageError> {
        let entries = self.store.entries(Store::Records).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice::<PendingRecord>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping corrupt record {}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    /// Number of captured records. Served from the cached counter; recounted
    /// from the records table when the counter is missing or unreadable.
    pub async fn log_count(&self) -> Result<u64, StorageError> {
        let _guard = self.count_lock.lock().await;
        self.read_count().await
    }

    async fn read_count(&self) -> Result<u64, StorageError> {
        match self.store.get_json::<u64>(Store::Meta, LOG_COUNT_KEY).await {
            Ok(Some(count)) => return Ok(count),
            Ok(None) => {}
            Err(StorageError::Serialization(e)) => warn!("Log count is corrupt, recounting: {}", e),
            Err(e) => return Err(e),
        }

        let count = self.store.list_keys(Store::Records).await?.len() as u64;
        self.store.put_json(Store::Meta, LOG_COUNT_KEY, &count).await?;
        Ok(count)
    }

    /// All records as one JSON tree: every path segment becomes a nested
    /// object and the file name maps to the record itself.
    pub async fn export_all(&self) -> Result<Value, StorageError> {
        let mut root = Map::new();

        for (key, bytes) in self.store.entries(Store::Records).await? {
            let record: Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Error exporting record {}: {}", key, e);
                    continue;
                }
            };
            insert_at_path(&mut root, &key, record);
        }

        Ok(Value::Object(root))
    }

    /// Remove every record, the pending index, the count and the index
    /// migration marker. Returns how many records were removed.
    pub async fn clear_all(&self) -> Result<usize, StorageError> {
        let _guard = self.count_lock.lock().await;
        let removed = self.store.clear(Store::Records).await?;
        self.queue.clear().await?;
        self.store.put_json(Store::Meta, LOG_COUNT_KEY, &0u64).await?;
        self.store.delete(Store::Meta, PENDING_INDEX_MARKER).await?;
        info!("Cleared {} records", removed);
        Ok(removed)
    }
}

fn insert_at_path(root: &mut Map<String, Value>, key: &str, record: Value) {
    let mut parts: Vec<&str> = key.split('/').collect();
    let Some(leaf) = parts.pop() else {
        return;
    };

    let mut level = root;
    for part in parts {
        let slot = level
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        level = next;
    }
    level.insert(leaf.to_string(), record);
}
