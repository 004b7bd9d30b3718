//! ============================================================================
//! Engine - Wiring and the surface the HUD talks to
//! ============================================================================
//! `Engine::start` opens the database and builds every component exactly
//! once from an [`EngineConfig`] plus the injected collaborators. There is
//! no global state: drop the engine (after `shutdown`) and everything goes.
//! ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::{AuthState, AuthStatus, Subscription};
use crate::cache::{IntelligenceCache, DEFAULT_PERSIST_DELAY};
use crate::config::EngineConfig;
use crate::db::{DbStats, DurableStore};
use crate::error::StorageError;
use crate::gate::FetchGate;
use crate::orchestrator::{CycleOutcome, IntelligenceOrchestrator, MilestoneCallback, RoadOracle};
use crate::queue::PendingWriteQueue;
use crate::records::RecordLog;
use crate::sync::{DrainReport, ObjectUploader, SyncCoordinator};
use crate::types::{HudStatus, PositionFix};

/// External services the engine depends on
pub struct Collaborators {
    pub oracle: Arc<dyn RoadOracle>,
    pub uploader: Arc<dyn ObjectUploader>,
    pub auth: Arc<AuthStatus>,
    /// Audio cue for limit changes
    pub on_milestone: Option<MilestoneCallback>,
}

pub struct Engine {
    config: EngineConfig,
    store: DurableStore,
    cache: Arc<IntelligenceCache>,
    records: Arc<RecordLog>,
    sync: Arc<SyncCoordinator>,
    orchestrator: IntelligenceOrchestrator,
    auth: Arc<AuthStatus>,
    _auth_subscription: Subscription,
}

impl Engine {
    /// Open storage, hydrate the cache and wire all components
    pub async fn start(config: EngineConfig, parts: Collaborators) -> Result<Self, StorageError> {
        info!("Starting roadwatch engine");
        let store = DurableStore::open(&config.db_path)?;

        let cache = Arc::new(IntelligenceCache::with_limits(
            store.clone(),
            config.cache_capacity,
            DEFAULT_PERSIST_DELAY,
        ));
        if let Err(e) = cache.hydrate().await {
            warn!("Cache hydration failed, starting empty: {}", e);
        }

        let queue = Arc::new(PendingWriteQueue::open(store.clone()).await?);
        let records = Arc::new(
            RecordLog::open(store.clone(), queue, config.record_prefix.clone()).await?,
        );

        let auth_state: Arc<dyn AuthState> = parts.auth.clone();
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&records),
            parts.uploader,
            auth_state,
        ));

        let mut orchestrator = IntelligenceOrchestrator::new(
            Arc::clone(&cache),
            parts.oracle,
            Arc::clone(&records),
            store.clone(),
        )
        .with_gate(FetchGate::with_config(config.gate.clone()))
        .with_sync(Arc::clone(&sync));
        if let Some(callback) = parts.on_milestone {
            orchestrator = orchestrator.with_milestone_callback(move |limit| callback(limit));
        }
        orchestrator.set_logging_enabled(config.logging_enabled);
        orchestrator.set_cloud_sync_enabled(config.cloud_sync_enabled);
        orchestrator.start().await?;

        let subscription =
            Self::drain_on_sign_in(&parts.auth, &sync, orchestrator.cloud_sync_flag());

        info!(
            "Engine ready: {} cached segments, {} pending records",
            cache.size(),
            records.queue().len().await
        );

        Ok(Self {
            config,
            store,
            cache,
            records,
            sync,
            orchestrator,
            auth: parts.auth,
            _auth_subscription: subscription,
        })
    }

    /// Flush the backlog whenever the user signs in, if mirroring is on
    fn drain_on_sign_in(
        auth: &Arc<AuthStatus>,
        sync: &Arc<SyncCoordinator>,
        cloud_sync_enabled: Arc<AtomicBool>,
    ) -> Subscription {
        let sync: Weak<SyncCoordinator> = Arc::downgrade(sync);
        auth.subscribe(move |authenticated| {
            if !authenticated || !cloud_sync_enabled.load(Ordering::Relaxed) {
                return;
            }
            let Some(sync) = sync.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!("Signed in outside the runtime, backlog left for the next sync");
                return;
            };
            runtime.spawn(async move {
                match sync.drain().await {
                    Ok(report) if report.synced > 0 => {
                        info!("Signed in: uploaded {} pending records", report.synced)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Drain after sign-in failed: {}", e),
                }
            });
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn auth(&self) -> &Arc<AuthStatus> {
        &self.auth
    }

    pub fn cache(&self) -> &IntelligenceCache {
        &self.cache
    }

    pub fn status(&self) -> HudStatus {
        self.orchestrator.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<HudStatus> {
        self.orchestrator.subscribe()
    }

    pub async fn on_position(&self, fix: &PositionFix) -> CycleOutcome {
        self.orchestrator.on_position(fix).await
    }

    pub async fn on_distance_milestone(&self, traveled_miles: f64) -> Option<u32> {
        self.orchestrator.on_distance_milestone(traveled_miles).await
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.orchestrator.set_logging_enabled(enabled);
    }

    pub fn set_cloud_sync_enabled(&self, enabled: bool) {
        self.orchestrator.set_cloud_sync_enabled(enabled);
    }

    /// Upload everything still pending
    pub async fn trigger_manual_sync(&self) -> Result<DrainReport, StorageError> {
        self.sync.drain().await
    }

    pub async fn pending_count(&self) -> usize {
        self.records.queue().len().await
    }

    pub async fn export_all_records(&self) -> Result<serde_json::Value, StorageError> {
        self.records.export_all().await
    }

    pub async fn clear_all_records(&self) -> Result<usize, StorageError> {
        let removed = self.records.clear_all().await?;
        self.orchestrator.refresh_log_count().await?;
        Ok(removed)
    }

    pub async fn log_count(&self) -> Result<u64, StorageError> {
        self.records.log_count().await
    }

    pub async fn stats(&self) -> Result<DbStats, StorageError> {
        self.store.stats().await
    }

    /// Let background mirrors finish and write the cache out now
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.orchestrator.settle().await;
        let persisted = self.cache.flush().await?;
        info!("Engine stopped, {} cache entries persisted", persisted);
        Ok(())
    }
}
