//! ============================================================================
//! Pending Write Queue - Durable index of records awaiting upload
//! ============================================================================
//! The index is one JSON array stored under a single meta key, mirrored in
//! memory with a set for O(1) membership. Every change is written through
//! before the call returns; a failed write rolls the in-memory change back.
//! ============================================================================

use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{DurableStore, Store};
use crate::error::StorageError;

/// Meta key of the persisted pending index
pub const PENDING_INDEX_KEY: &str = "pending_keys";

#[derive(Debug, Clone, Default)]
struct PendingIndex {
    order: Vec<String>,
    members: HashSet<String>,
}

impl PendingIndex {
    fn from_ids(ids: Vec<String>) -> Self {
        let mut index = Self::default();
        for id in ids {
            index.push(id);
        }
        index
    }

    fn push(&mut self, id: String) -> bool {
        if self.members.insert(id.clone()) {
            self.order.push(id);
            true
        } else {
            false
        }
    }

    fn remove_all(&mut self, ids: &[String]) -> usize {
        let doomed: HashSet<&String> = ids.iter().filter(|id| self.members.contains(*id)).collect();
        if doomed.is_empty() {
            return 0;
        }
        self.order.retain(|id| !doomed.contains(id));
        for id in &doomed {
            self.members.remove(*id);
        }
        doomed.len()
    }
}

/// Ordered set of record ids that still need uploading
pub struct PendingWriteQueue {
    store: DurableStore,
    index: Mutex<PendingIndex>,
}

impl PendingWriteQueue {
    /// Load the persisted index. A corrupt index is logged and treated as empty.
    pub async fn open(store: DurableStore) -> Result<Self, StorageError> {
        let ids = match store.get_json::<Vec<String>>(Store::Meta, PENDING_INDEX_KEY).await {
            Ok(ids) => ids.unwrap_or_default(),
            Err(StorageError::Serialization(e)) => {
                warn!("Pending index is corrupt, starting empty: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        debug!("Loaded {} pending record ids", ids.len());

        Ok(Self {
            store,
            index: Mutex::new(PendingIndex::from_ids(ids)),
        })
    }

    async fn write_index(&self, index: &PendingIndex) -> Result<(), StorageError> {
        self.store
            .put_json(Store::Meta, PENDING_INDEX_KEY, &index.order)
            .await
    }

    /// Append if absent. Re-enqueueing a present id is a no-op.
    /// Returns whether the id was added.
    pub async fn enqueue(&self, record_id: &str) -> Result<bool, StorageError> {
        let mut index = self.index.lock().await;
        if index.members.contains(record_id) {
            return Ok(false);
        }

        let mut next = index.clone();
        next.push(record_id.to_string());
        self.write_index(&next).await?;
        *index = next;
        debug!("Enqueued {}", record_id);
        Ok(true)
    }

    /// Remove if present. Returns whether the id was removed.
    pub async fn dequeue(&self, record_id: &str) -> Result<bool, StorageError> {
        Ok(self.dequeue_batch(&[record_id.to_string()]).await? == 1)
    }

    /// Remove every given id with a single index write (none if nothing changes)
    pub async fn dequeue_batch(&self, record_ids: &[String]) -> Result<usize, StorageError> {
        let mut index = self.index.lock().await;

        let mut next = index.clone();
        let removed = next.remove_all(record_ids);
        if removed == 0 {
            return Ok(0);
        }

        self.write_index(&next).await?;
        *index = next;
        debug!("Dequeued {} record ids", removed);
        Ok(removed)
    }

    /// Add every id not already present with a single index write
    pub async fn enqueue_batch(&self, record_ids: Vec<String>) -> Result<usize, StorageError> {
        let mut index = self.index.lock().await;

        let mut next = index.clone();
        let added = record_ids.into_iter().filter(|id| next.push(id.clone())).count();
        if added == 0 {
            return Ok(0);
        }

        self.write_index(&next).await?;
        *index = next;
        Ok(added)
    }

    /// Snapshot of pending ids, oldest first
    pub async fn list(&self) -> Vec<String> {
        self.index.lock().await.order.clone()
    }

    pub async fn contains(&self, record_id: &str) -> bool {
        self.index.lock().await.members.contains(record_id)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every pending id
    pub async fn clear(&self) -> Result<(), StorageError> {
        let mut index = self.index.lock().await;
        self.store.delete(Store::Meta, PENDING_INDEX_KEY).await?;
        *index = PendingIndex::default();
        Ok(())
    }
}
