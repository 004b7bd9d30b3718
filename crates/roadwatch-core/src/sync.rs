//! ============================================================================
//! Sync Coordinator - Drains pending records to the remote object store
//! ============================================================================
//! Delivery is at-least-once: a record leaves the pending index only after
//! its upload succeeded and the synced copy was written locally. Anything
//! else stays pending for the next drain.
//! ============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::error::{StorageError, UploadError};
use crate::records::RecordLog;

/// Remote object store that records are mirrored to
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Upload one file into the folder `path`; returns the remote id
    async fn upload(&self, filename: &str, content: &str, path: &str) -> Result<String, UploadError>;
}

/// Outcome of one [`SyncCoordinator::drain`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Uploaded during this drain
    pub synced: usize,
    /// Upload attempts that failed and stay pending
    pub failed: usize,
    /// Ids dropped from the pending index
    pub removed: usize,
    /// Another drain was already running
    pub skipped: bool,
}

enum SyncStep {
    Uploaded,
    Orphaned,
    AlreadySynced,
    Failed,
}

impl SyncStep {
    fn leaves_queue(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

pub struct SyncCoordinator {
    records: Arc<RecordLog>,
    uploader: Arc<dyn ObjectUploader>,
    auth: Arc<dyn AuthState>,
    in_flight: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        records: Arc<RecordLog>,
        uploader: Arc<dyn ObjectUploader>,
        auth: Arc<dyn AuthState>,
    ) -> Self {
        Self {
            records,
            uploader,
            auth,
            in_flight: Mutex::new(()),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Upload every pending record, in index order
    pub async fn drain(&self) -> Result<DrainReport, StorageError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Drain already in progress");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };

        if !self.auth.is_authenticated() {
            return Ok(DrainReport::default());
        }

        let pending = self.records.queue().list().await;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }
        info!("Draining {} pending records", pending.len());

        let mut report = DrainReport::default();
        let mut done = Vec::new();
        for record_id in pending {
            let step = self.sync_one(&record_id).await;
            match step {
                SyncStep::Uploaded => report.synced += 1,
                SyncStep::Failed => report.failed += 1,
                SyncStep::Orphaned | SyncStep::AlreadySynced => {}
            }
            if step.leaves_queue() {
                done.push(record_id);
            }
        }

        // a failed batch write is healed by the next drain: those
        // records are synced by then and get dropped without re-upload
        report.removed = self.records.queue().dequeue_batch(&done).await?;

        info!(
            "Drain complete: {} synced, {} failed, {} removed",
            report.synced, report.failed, report.removed
        );
        Ok(report)
    }

    /// Best-effort upload of a single freshly captured record.
    /// Returns whether it was uploaded.
    pub async fn mirror(&self, record_id: &str) -> Result<bool, StorageError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Drain running, {} left for it", record_id);
            return Ok(false);
        };
        if !self.auth.is_authenticated() {
            return Ok(false);
        }

        let step = self.sync_one(record_id).await;
        if step.leaves_queue() {
            self.records.queue().dequeue(record_id).await?;
        }
        Ok(matches!(step, SyncStep::Uploaded))
    }

    async fn sync_one(&self, record_id: &str) -> SyncStep {
        let mut record = match self.records.get(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return SyncStep::Orphaned,
            Err(e) => {
                warn!("Could not read pending record {}: {}", record_id, e);
                return SyncStep::Failed;
            }
        };
        if record.synced {
            return SyncStep::AlreadySynced;
        }

        let content = match serde_json::to_string_pretty(&record) {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not encode record {}: {}", record_id, e);
                return SyncStep::Failed;
            }
        };

        let remote_id = match self
            .uploader
            .upload(&record.filename, &content, &record.path)
            .await
        {
            Ok(remote_id) => remote_id,
            Err(e) => {
                warn!("Sync retry failed for {}: {}", record_id, e);
                return SyncStep::Failed;
            }
        };

        match self.records.mark_synced(&mut record, remote_id).await {
            Ok(()) => {
                debug!("Uploaded {}", record_id);
                SyncStep::Uploaded
            }
            Err(e) => {
                warn!("Uploaded {} but could not store it as synced: {}", record_id, e);
                SyncStep::Failed
            }
        }
    }
}
