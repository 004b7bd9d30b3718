// ============================================================================
// DurableStore - Embedded Database (redb)
// ============================================================================
// Persistent, namespaced key -> bytes storage shared by the intelligence
// cache, the record log, the pending index and the last-known-good snapshot.
// Every operation is one redb transaction run on the blocking pool, so a
// failed operation leaves nothing behind.
// ============================================================================

pub mod types;

pub use types::{DbStats, Store};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StorageError;

// Table definitions
const INTELLIGENCE: TableDefinition<&str, &[u8]> = TableDefinition::new("road_intelligence");
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SNAPSHOT: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshot");

fn table(store: Store) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match store {
        Store::Intelligence => INTELLIGENCE,
        Store::Records => RECORDS,
        Store::Meta => META,
        Store::Snapshot => SNAPSHOT,
    }
}

struct Inner {
    db: Database,
    path: PathBuf,
    commits: [AtomicU64; Store::COUNT],
    #[cfg(test)]
    failing: [AtomicBool; Store::COUNT],
}

impl Inner {
    fn write<T>(
        &self,
        store: Store,
        op: impl FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        #[cfg(test)]
        if self.failing[store.index()].load(Ordering::Relaxed) {
            return Err(StorageError::Engine(format!("writes to {} disabled", store.name())));
        }
        let write_txn = self.db.begin_write().map_err(StorageError::engine)?;
        let out = {
            let mut table = write_txn.open_table(table(store)).map_err(StorageError::engine)?;
            op(&mut table)?
        };
        write_txn.commit().map_err(StorageError::engine)?;
        self.commits[store.index()].fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    fn get(&self, store: Store, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let read_txn = self.db.begin_read().map_err(StorageError::engine)?;
        let table = read_txn.open_table(table(store)).map_err(StorageError::engine)?;
        let value = table.get(key).map_err(StorageError::engine)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn entries(&self, store: Store) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let read_txn = self.db.begin_read().map_err(StorageError::engine)?;
        let table = read_txn.open_table(table(store)).map_err(StorageError::engine)?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..).map_err(StorageError::engine)?;
        for entry in iter {
            let (key, value) = entry.map_err(StorageError::engine)?;
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}

/// Remove every row of an open table inside the current transaction
fn clear_table(table: &mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<usize, StorageError> {
    let keys = table
        .range::<&str>(..)
        .map_err(StorageError::engine)?
        .map(|entry| entry.map(|(k, _)| k.value().to_string()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::engine)?;

    for key in &keys {
        table.remove(key.as_str()).map_err(StorageError::engine)?;
    }
    Ok(keys.len())
}

/// Embedded, asynchronous key-value store with one table per [`Store`]
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<Inner>,
}

impl DurableStore {
    /// Open (or create) the database at the given path and make sure every
    /// namespace table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Engine(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(StorageError::engine)?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write().map_err(StorageError::engine)?;
        for store in Store::ALL {
            write_txn.open_table(table(store)).map_err(StorageError::engine)?;
        }
        write_txn.commit().map_err(StorageError::engine)?;

        info!("Database ready");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                path: db_path,
                commits: Default::default(),
                #[cfg(test)]
                failing: Default::default(),
            }),
        })
    }

    /// Make every write to `store` fail until switched back
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, store: Store, fail: bool) {
        self.inner.failing[store.index()].store(fail, Ordering::Relaxed);
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    // ========================================================================
    // Key-Value Operations
    // ========================================================================

    pub async fn get(&self, store: Store, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.run(move |inner| inner.get(store, &key)).await
    }

    pub async fn put(&self, store: Store, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let key = key.to_string();
        self.run(move |inner| {
            inner.write(store, |table| {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(StorageError::engine)?;
                Ok(())
            })?;
            debug!("Stored {}:{}", store.name(), key);
            Ok(())
        })
        .await
    }

    /// Returns whether the key existed
    pub async fn delete(&self, store: Store, key: &str) -> Result<bool, StorageError> {
        let key = key.to_string();
        self.run(move |inner| {
            let removed = inner.write(store, |table| {
                Ok(table
                    .remove(key.as_str())
                    .map_err(StorageError::engine)?
                    .is_some())
            })?;
            if removed {
                debug!("Deleted {}:{}", store.name(), key);
            }
            Ok(removed)
        })
        .await
    }

    pub async fn list_keys(&self, store: Store) -> Result<Vec<String>, StorageError> {
        let entries = self.entries(store).await?;
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn list_values(&self, store: Store) -> Result<Vec<Vec<u8>>, StorageError> {
        let entries = self.entries(store).await?;
        Ok(entries.into_iter().map(|(_, v)| v).collect())
    }

    /// All rows of a namespace, ordered by key
    pub async fn entries(&self, store: Store) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.run(move |inner| inner.entries(store)).await
    }

    /// Returns the number of rows removed
    pub async fn clear(&self, store: Store) -> Result<usize, StorageError> {
        self.run(move |inner| {
            let removed = inner.write(store, clear_table)?;
            info!("Cleared {} entries from {}", removed, store.name());
            Ok(removed)
        })
        .await
    }

    /// Replace the whole namespace with `entries` in a single transaction
    pub async fn replace_all(
        &self,
        store: Store,
        entries: Vec<(String, Vec<u8>)>,
    ) -> Result<(), StorageError> {
        self.run(move |inner| {
            inner.write(store, |table| {
                clear_table(table)?;
                for (key, value) in &entries {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(StorageError::engine)?;
                }
                Ok(())
            })?;
            debug!("Replaced {} with {} entries", store.name(), entries.len());
            Ok(())
        })
        .await
    }

    // ========================================================================
    // JSON Helpers
    // ========================================================================

    /// Read and decode a JSON value; undecodable bytes are a `Serialization` error
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        store: Store,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.get(store, key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(StorageError::serialization),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        store: Store,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(StorageError::serialization)?;
        self.put(store, key, bytes).await
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Committed write transactions against `store` since this handle was opened
    pub fn commit_count(&self, store: Store) -> u64 {
        self.inner.commits[store.index()].load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> Result<DbStats, StorageError> {
        let mut stats = DbStats::default();
        for store in Store::ALL {
            let count = self.entries(store).await?.len();
            stats.entries.insert(store.name().to_string(), count);
            stats
                .commits
                .insert(store.name().to_string(), self.commit_count(store));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, DurableStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, db) = open_temp();

        assert_eq!(db.get(Store::Meta, "k").await.unwrap(), None);
        db.put(Store::Meta, "k", b"v1".to_vec()).await.unwrap();
        db.put(Store::Meta, "k", b"v2".to_vec()).await.unwrap();
        assert_eq!(db.get(Store::Meta, "k").await.unwrap(), Some(b"v2".to_vec()));

        assert!(db.delete(Store::Meta, "k").await.unwrap());
        assert!(!db.delete(Store::Meta, "k").await.unwrap());
        assert_eq!(db.get(Store::Meta, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let (_dir, db) = open_temp();

        db.put(Store::Records, "same", b"record".to_vec()).await.unwrap();
        db.put(Store::Meta, "same", b"meta".to_vec()).await.unwrap();

        assert_eq!(db.get(Store::Records, "same").await.unwrap(), Some(b"record".to_vec()));
        assert_eq!(db.get(Store::Meta, "same").await.unwrap(), Some(b"meta".to_vec()));
        assert_eq!(db.get(Store::Snapshot, "same").await.unwrap(), None);

        db.clear(Store::Records).await.unwrap();
        assert_eq!(db.get(Store::Meta, "same").await.unwrap(), Some(b"meta".to_vec()));
    }

    #[tokio::test]
    async fn test_list_keys_and_values() {
        let (_dir, db) = open_temp();

        db.put(Store::Records, "b", b"2".to_vec()).await.unwrap();
        db.put(Store::Records, "a", b"1".to_vec()).await.unwrap();

        assert_eq!(db.list_keys(Store::Records).await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            db.list_values(Store::Records).await.unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );
        assert_eq!(db.clear(Store::Records).await.unwrap(), 2);
        assert!(db.list_keys(Store::Records).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_all_is_one_commit() {
        let (_dir, db) = open_temp();

        db.put(Store::Intelligence, "stale", b"x".to_vec()).await.unwrap();
        let before = db.commit_count(Store::Intelligence);

        let entries = (0..10).map(|i| (format!("k{}", i), vec![i as u8])).collect();
        db.replace_all(Store::Intelligence, entries).await.unwrap();

        assert_eq!(db.commit_count(Store::Intelligence), before + 1);
        let keys = db.list_keys(Store::Intelligence).await.unwrap();
        assert_eq!(keys.len(), 10);
        assert!(!keys.contains(&"stale".to_string()));
    }

    #[tokio::test]
    async fn test_json_helpers_and_corruption() {
        let (_dir, db) = open_temp();

        db.put_json(Store::Meta, "list", &vec!["a", "b"]).await.unwrap();
        let list: Option<Vec<String>> = db.get_json(Store::Meta, "list").await.unwrap();
        assert_eq!(list, Some(vec!["a".to_string(), "b".to_string()]));

        db.put(Store::Meta, "bad", b"{not json".to_vec()).await.unwrap();
        let bad: Result<Option<Vec<String>>, _> = db.get_json(Store::Meta, "bad").await;
        assert!(matches!(bad, Err(StorageError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/test.redb");
        {
            let db = DurableStore::open(&path).unwrap();
            db.put(Store::Snapshot, "last", b"kept".to_vec()).await.unwrap();
        }
        let db = DurableStore::open(&path).unwrap();
        assert_eq!(db.get(Store::Snapshot, "last").await.unwrap(), Some(b"kept".to_vec()));
        assert_eq!(db.commit_count(Store::Snapshot), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, db) = open_temp();
        db.put(Store::Records, "r1", b"{}".to_vec()).await.unwrap();
        db.put(Store::Records, "r2", b"{}".to_vec()).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.entries["records"], 2);
        assert_eq!(stats.entries["meta"], 0);
        assert_eq!(stats.commits["records"], 2);
    }
}
