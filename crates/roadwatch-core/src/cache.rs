//! ============================================================================
//! Intelligence Cache - Bounded GeoKey -> RoadInfo map with write-back
//! ============================================================================
//! Lookups and inserts are synchronous and in-memory. Writes reach the
//! durable store through a debounced persist: a burst of inserts produces a
//! single batch once the map has been quiet for the persist delay. The size
//! bound is enforced at persist time by dropping the oldest-inserted entries.
//! ============================================================================

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::{DurableStore, Store};
use crate::debounce::Debouncer;
use crate::error::StorageError;
use crate::geo::GeoKey;
use crate::types::RoadInfo;

/// Maximum number of entries kept across sessions
pub const DEFAULT_CAPACITY: usize = 500;

/// Quiet period before a burst of inserts is written back
pub const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(2000);

/// Meta key of the pre-redb flat cache blob (JSON object GeoKey -> RoadInfo)
pub const LEGACY_BLOB_KEY: &str = "road_intelligence_db_v2";

/// Meta key marking the legacy blob migration as done
pub const MIGRATION_MARKER: &str = "migration:intelligence_v2";

/// Row format of the intelligence table
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    /// Insertion sequence, restores eviction order after a reload
    seq: u64,
    info: RoadInfo,
}

#[derive(Default)]
struct CacheMap {
    entries: HashMap<GeoKey, (u64, RoadInfo)>,
    next_seq: u64,
}

impl CacheMap {
    fn insert(&mut self, key: GeoKey, info: RoadInfo) {
        match self.entries.get_mut(&key) {
            // overwrite keeps the original insertion position
            Some((_, existing)) => *existing = info,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(key, (seq, info));
            }
        }
    }

    fn restore(&mut self, key: GeoKey, seq: u64, info: RoadInfo) {
        self.next_seq = self.next_seq.max(seq + 1);
        self.entries.entry(key).or_insert((seq, info));
    }

    /// Drop oldest-inserted entries until at most `capacity` remain
    fn prune(&mut self, capacity: usize) -> usize {
        if self.entries.len() <= capacity {
            return 0;
        }
        let mut order: Vec<(u64, GeoKey)> = self
            .entries
            .iter()
            .map(|(key, (seq, _))| (*seq, key.clone()))
            .collect();
        order.sort_unstable_by_key(|(seq, _)| *seq);

        let excess = self.entries.len() - capacity;
        for (_, key) in order.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }

    fn encode(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.entries
            .iter()
            .map(|(key, (seq, info))| {
                let row = StoredEntry {
                    seq: *seq,
                    info: info.clone(),
                };
                let bytes = bincode::serialize(&row).map_err(StorageError::serialization)?;
                Ok((key.as_str().to_string(), bytes))
            })
            .collect()
    }
}

struct Shared {
    store: DurableStore,
    capacity: usize,
    map: Mutex<CacheMap>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheMap> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prune, then write the whole map as one batch
    async fn persist(self: Arc<Self>) -> Result<usize, StorageError> {
        let batch = {
            let mut map = self.lock();
            let pruned = map.prune(self.capacity);
            if pruned > 0 {
                debug!("Pruned {} oldest cache entries", pruned);
            }
            map.encode()?
        };
        let count = batch.len();
        self.store.replace_all(Store::Intelligence, batch).await?;
        debug!("Persisted {} cache entries", count);
        Ok(count)
    }
}

/// Bounded, persisted cache of road intelligence keyed by [`GeoKey`]
pub struct IntelligenceCache {
    shared: Arc<Shared>,
    debouncer: Debouncer,
}

impl IntelligenceCache {
    pub fn new(store: DurableStore) -> Self {
        Self::with_limits(store, DEFAULT_CAPACITY, DEFAULT_PERSIST_DELAY)
    }

    pub fn with_limits(store: DurableStore, capacity: usize, persist_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                capacity,
                map: Mutex::new(CacheMap::default()),
            }),
            debouncer: Debouncer::new(persist_delay),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Load persisted entries. Call once at startup.
    /// With an empty table, a one-time migration of the legacy blob runs.
    /// Corrupt rows and blobs are skipped with a warning; only engine
    /// failures are returned.
    pub async fn hydrate(&self) -> Result<usize, StorageError> {
        let rows = self.shared.store.entries(Store::Intelligence).await?;
        if rows.is_empty() {
            return self.migrate_legacy().await;
        }

        let mut loaded = 0;
        let mut map = self.shared.lock();
        for (key, bytes) in rows {
            match bincode::deserialize::<StoredEntry>(&bytes) {
                Ok(row) => {
                    map.restore(GeoKey::from_raw(key), row.seq, row.info);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping corrupt cache entry {}: {}", key, e),
            }
        }
        info!("Hydrated {} cached road segments", loaded);
        Ok(loaded)
    }

    async fn migrate_legacy(&self) -> Result<usize, StorageError> {
        let store = &self.shared.store;
        if store.get(Store::Meta, MIGRATION_MARKER).await?.is_some() {
            return Ok(0);
        }

        let migrated = match store.get(Store::Meta, LEGACY_BLOB_KEY).await? {
            None => 0,
            Some(bytes) => match serde_json::from_slice::<OrderedEntries>(&bytes) {
                Ok(OrderedEntries(entries)) => {
                    let mut migrated = 0;
                    {
                        let mut map = self.shared.lock();
                        for (key, value) in entries {
                            match serde_json::from_value::<RoadInfo>(value) {
                                Ok(info) => {
                                    map.insert(GeoKey::from_raw(key), info);
                                    migrated += 1;
                                }
                                Err(e) => warn!("Skipping corrupt legacy entry {}: {}", key, e),
                            }
                        }
                    }
                    Arc::clone(&self.shared).persist().await?;
                    store.delete(Store::Meta, LEGACY_BLOB_KEY).await?;
                    info!("Migrated {} legacy cache entries", migrated);
                    migrated
                }
                Err(e) => {
                    // left in place; the marker stops us from retrying
                    warn!("Legacy cache blob is corrupt, starting empty: {}", e);
                    0
                }
            },
        };

        store.put(Store::Meta, MIGRATION_MARKER, b"true".to_vec()).await?;
        Ok(migrated)
    }

    pub fn lookup(&self, key: &GeoKey) -> Option<RoadInfo> {
        self.shared.lock().entries.get(key).map(|(_, info)| info.clone())
    }

    pub fn contains(&self, key: &GeoKey) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    /// Insert or overwrite, then (re)arm the debounced persist
    pub fn put(&self, key: GeoKey, value: RoadInfo) {
        self.shared.lock().insert(key, value);

        let shared = Arc::clone(&self.shared);
        self.debouncer.schedule(async move {
            if let Err(e) = shared.persist().await {
                warn!("Failed to persist intelligence cache: {}", e);
            }
        });
    }

    pub fn size(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Cancel the pending timer and persist immediately
    pub async fn flush(&self) -> Result<usize, StorageError> {
        self.debouncer.cancel();
        Arc::clone(&self.shared).persist().await
    }

    /// Wait for the pending debounced persist, if any, to finish
    pub async fn settle(&self) {
        self.debouncer.settle().await;
    }
}

/// JSON object read as a list of entries in document order
struct OrderedEntries(Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of cache entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                    entries.push((key, value));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::encode;

    fn open_temp() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path().join("cache.redb")).unwrap();
        (dir, store)
    }

    fn info(limit: u32, road: &str) -> RoadInfo {
        RoadInfo {
            limit: Some(limit),
            road_name: road.to_string(),
            road_type: "Highway".to_string(),
            police_district: String::new(),
            context: "test".to_string(),
            confidence: "High".to_string(),
            future_segments: Vec::new(),
        }
    }

    fn key(i: usize) -> GeoKey {
        GeoKey::from_raw(format!("K{:04}", i))
    }

    #[tokio::test]
    async fn test_lookup_after_put() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::new(store);

        let k = encode(34.0, -118.0, 90.0);
        assert!(cache.lookup(&k).is_none());
        cache.put(k.clone(), info(65, "I-5"));
        assert_eq!(cache.lookup(&k).unwrap().limit, Some(65));
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_puts_is_one_write_batch() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::new(store.clone());
        let before = store.commit_count(Store::Intelligence);

        for i in 0..25 {
            cache.put(key(i), info(30 + i as u32, "Main St"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(store.commit_count(Store::Intelligence), before);

        cache.settle().await;
        assert_eq!(store.commit_count(Store::Intelligence), before + 1);
        assert_eq!(store.list_keys(Store::Intelligence).await.unwrap().len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_keeps_most_recent_after_reload() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::new(store.clone());

        for i in 0..600 {
            cache.put(key(i), info(25, "Loop"));
        }
        assert_eq!(cache.size(), 600);
        cache.settle().await;
        assert_eq!(cache.size(), DEFAULT_CAPACITY);

        let reloaded = IntelligenceCache::new(store);
        assert_eq!(reloaded.hydrate().await.unwrap(), DEFAULT_CAPACITY);
        assert_eq!(reloaded.size(), DEFAULT_CAPACITY);
        for i in 0..100 {
            assert!(!reloaded.contains(&key(i)), "entry {} should be evicted", i);
        }
        for i in 100..600 {
            assert!(reloaded.contains(&key(i)), "entry {} should be kept", i);
        }
    }

    #[tokio::test]
    async fn test_overwrite_keeps_insertion_position() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::with_limits(store, 2, Duration::from_secs(60));

        cache.put(key(0), info(25, "Oldest"));
        cache.put(key(1), info(25, "Middle"));
        cache.put(key(0), info(35, "Oldest, updated"));
        cache.put(key(2), info(25, "Newest"));
        cache.flush().await.unwrap();

        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
    }

    #[tokio::test]
    async fn test_hydrate_restores_insertion_order() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::with_limits(store.clone(), 3, Duration::from_secs(60));
        // keys inserted in reverse lexical order
        for i in (0..3).rev() {
            cache.put(key(i), info(25, "Road"));
        }
        cache.flush().await.unwrap();

        let reloaded = IntelligenceCache::with_limits(store, 3, Duration::from_secs(60));
        reloaded.hydrate().await.unwrap();
        reloaded.put(key(9), info(25, "Road"));
        reloaded.flush().await.unwrap();

        // key(2) was inserted first, so it is the one evicted
        assert!(!reloaded.contains(&key(2)));
        assert!(reloaded.contains(&key(0)));
        assert!(reloaded.contains(&key(9)));
    }

    #[tokio::test]
    async fn test_legacy_blob_migration() {
        let (_dir, store) = open_temp();
        let legacy = serde_json::json!({
            "Z19-X1-Y1-HDG0": { "limit": 45, "roadName": "Old Rd", "roadType": "Arterial",
                                "policeDistrict": "", "context": "", "confidence": "",
                                "futureSegments": [] },
            "Z19-X2-Y2-HDG90": { "limit": null, "roadName": "Unknown" }
        });
        store
            .put(Store::Meta, LEGACY_BLOB_KEY, serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let cache = IntelligenceCache::new(store.clone());
        assert_eq!(cache.hydrate().await.unwrap(), 2);
        assert_eq!(
            cache.lookup(&GeoKey::from_raw("Z19-X1-Y1-HDG0")).unwrap().road_name,
            "Old Rd"
        );

        assert!(store.get(Store::Meta, LEGACY_BLOB_KEY).await.unwrap().is_none());
        assert!(store.get(Store::Meta, MIGRATION_MARKER).await.unwrap().is_some());
        assert_eq!(store.list_keys(Store::Intelligence).await.unwrap().len(), 2);

        // second run reads the migrated table, not the blob
        let again = IntelligenceCache::new(store);
        assert_eq!(again.hydrate().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_legacy_blob_is_not_fatal() {
        let (_dir, store) = open_temp();
        store
            .put(Store::Meta, LEGACY_BLOB_KEY, b"{\"broken\": [".to_vec())
            .await
            .unwrap();

        let cache = IntelligenceCache::new(store.clone());
        assert_eq!(cache.hydrate().await.unwrap(), 0);
        assert_eq!(cache.size(), 0);
        assert!(store.get(Store::Meta, MIGRATION_MARKER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_migration_skipped_when_marked() {
        let (_dir, store) = open_temp();
        store.put(Store::Meta, MIGRATION_MARKER, b"true".to_vec()).await.unwrap();
        let legacy = serde_json::json!({ "Z19-X1-Y1-HDG0": { "limit": 45, "roadName": "Old Rd" } });
        store
            .put(Store::Meta, LEGACY_BLOB_KEY, serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let cache = IntelligenceCache::new(store);
        assert_eq!(cache.hydrate().await.unwrap(), 0);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_row_skipped_on_hydrate() {
        let (_dir, store) = open_temp();
        let cache = IntelligenceCache::new(store.clone());
        cache.put(key(1), info(55, "Good"));
        cache.flush().await.unwrap();
        store.put(Store::Intelligence, "garbage", vec![0xff, 0x01]).await.unwrap();

        let reloaded = IntelligenceCache::new(store);
        assert_eq!(reloaded.hydrate().await.unwrap(), 1);
        assert!(reloaded.contains(&key(1)));
    }
}
