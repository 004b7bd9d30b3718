//! ============================================================================
//! Intelligence Orchestrator - Per-fix lookup cycle
//! ============================================================================
//! Every position fix runs one cycle:
//!
//!   gate -> cache lookup -> (hit: adopt) | (miss: oracle -> adopt, cache,
//!   snapshot, capture record, mirror in background)
//!
//! followed by a milestone check against the upcoming segments. Cycles never
//! overlap; a fix arriving while one is in flight is dropped. Oracle errors
//! become status errors and never escape.
//! ============================================================================

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::IntelligenceCache;
use crate::db::{DurableStore, Store};
use crate::debounce::Debouncer;
use crate::error::{OracleError, StatusError, StorageError};
use crate::gate::{FetchGate, FetchState, GateDecision, MotionSample};
use crate::geo::{self, GeoKey};
use crate::records::RecordLog;
use crate::sync::SyncCoordinator;
use crate::types::{HudStatus, PositionFix, RoadInfo, DEFAULT_LIMIT_MPH};

/// Snapshot-store key of the last road data successfully fetched
pub const LAST_ROAD_INFO_KEY: &str = "last_road_info";

/// How long the "served from cache" flag stays up after a hit
pub const CACHED_FLAG_DURATION: Duration = Duration::from_millis(3000);

/// Remote "what is the road like here" service
#[async_trait]
pub trait RoadOracle: Send + Sync {
    async fn fetch_road_info(
        &self,
        lat: f64,
        lng: f64,
        heading: f64,
        road_name_hint: Option<&str>,
    ) -> Result<RoadInfo, OracleError>;
}

/// Called with the new limit whenever the displayed limit changes
pub type MilestoneCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was in flight; the fix was dropped
    Busy,
    /// The gate declined to look anything up
    Skipped(GateDecision),
    CacheHit,
    /// Fresh road data with a limit was adopted
    Applied { limit: u32 },
    /// The oracle answered without a limit; nothing adopted
    NoLimit,
    /// Quota exceeded, cooldown started
    QuotaBackoff,
    /// Any other oracle failure
    Failed,
}

pub struct IntelligenceOrchestrator {
    gate: FetchGate,
    cache: Arc<IntelligenceCache>,
    oracle: Arc<dyn RoadOracle>,
    records: Arc<RecordLog>,
    store: DurableStore,
    sync: Option<Arc<SyncCoordinator>>,
    milestone: Option<MilestoneCallback>,
    logging_enabled: AtomicBool,
    cloud_sync_enabled: Arc<AtomicBool>,
    /// Held for the whole cycle; `try_lock` failure means busy
    cycle: Mutex<FetchState>,
    status: Arc<watch::Sender<HudStatus>>,
    cached_flag: Debouncer,
    background: StdMutex<JoinSet<()>>,
}

impl IntelligenceOrchestrator {
    pub fn new(
        cache: Arc<IntelligenceCache>,
        oracle: Arc<dyn RoadOracle>,
        records: Arc<RecordLog>,
        store: DurableStore,
    ) -> Self {
        let (status, _) = watch::channel(HudStatus::new(RoadInfo::initializing(), 0));
        Self {
            gate: FetchGate::new(),
            cache,
            oracle,
            records,
            store,
            sync: None,
            milestone: None,
            logging_enabled: AtomicBool::new(true),
            cloud_sync_enabled: Arc::new(AtomicBool::new(false)),
            cycle: Mutex::new(FetchState::default()),
            status: Arc::new(status),
            cached_flag: Debouncer::new(CACHED_FLAG_DURATION),
            background: StdMutex::new(JoinSet::new()),
        }
    }

    pub fn with_gate(mut self, gate: FetchGate) -> Self {
        self.gate = gate;
        self
    }

    /// Coordinator used to mirror captured records right away
    pub fn with_sync(mut self, sync: Arc<SyncCoordinator>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_milestone_callback(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.milestone = Some(Arc::new(callback));
        self
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_cloud_sync_enabled(&self, enabled: bool) {
        self.cloud_sync_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Live view of the cloud mirroring toggle
    pub fn cloud_sync_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cloud_sync_enabled)
    }

    /// Seed the HUD from the last-known-good snapshot and the stored log count
    pub async fn start(&self) -> Result<(), StorageError> {
        let road_info = match self
            .store
            .get_json::<RoadInfo>(Store::Snapshot, LAST_ROAD_INFO_KEY)
            .await
        {
            Ok(Some(info)) => {
                info!("Restored last road: {}", info.road_name);
                info
            }
            Ok(None) => RoadInfo::initializing(),
            Err(StorageError::Serialization(e)) => {
                warn!("Ignoring corrupt road snapshot: {}", e);
                RoadInfo::initializing()
            }
            Err(e) => return Err(e),
        };
        let log_count = self.records.log_count().await?;

        let status = HudStatus::new(road_info, log_count);
        self.cycle.lock().await.previous_limit = Some(status.last_valid_limit);
        self.status.send_replace(status);
        Ok(())
    }

    pub fn status(&self) -> HudStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HudStatus> {
        self.status.subscribe()
    }

    /// Re-read the record count into the status, after an external clear
    pub async fn refresh_log_count(&self) -> Result<u64, StorageError> {
        let count = self.records.log_count().await?;
        self.status.send_modify(|s| s.log_count = count);
        Ok(count)
    }

    /// Run one lookup cycle for a fix
    pub async fn on_position(&self, fix: &PositionFix) -> CycleOutcome {
        let Ok(mut fetch) = self.cycle.try_lock() else {
            debug!("Cycle in flight, dropping fix");
            return CycleOutcome::Busy;
        };

        let outcome = self.run_cycle(&mut fetch, fix).await;

        if let Some(traveled) = fetch.traveled_since_fetch(&fix.coords) {
            self.apply_milestone(&mut fetch, traveled);
        }
        outcome
    }

    async fn run_cycle(&self, fetch: &mut FetchState, fix: &PositionFix) -> CycleOutcome {
        let now = Instant::now();
        let have_any_data = !self.status.borrow().road_info.is_placeholder();

        let decision = self
            .gate
            .evaluate(&MotionSample::from(fix), fetch, have_any_data, now);
        if !decision.allows_fetch() {
            return CycleOutcome::Skipped(decision);
        }

        let key = geo::encode(fix.coords.latitude, fix.coords.longitude, fix.bearing);
        if let Some(cached) = self.cache.lookup(&key) {
            self.adopt_cached(cached);
            fetch.record_fetch(fix.coords, fix.bearing);
            debug!("Cache hit for {}", key);
            return CycleOutcome::CacheHit;
        }

        self.cached_flag.cancel();
        self.status.send_modify(|s| {
            s.is_updating = true;
            s.is_cached = false;
        });

        let outcome = self.fetch_remote(fetch, fix, key, now).await;
        self.status.send_modify(|s| s.is_updating = false);
        outcome
    }

    fn adopt_cached(&self, cached: RoadInfo) {
        self.status.send_modify(|s| {
            s.last_valid_limit = cached.limit.unwrap_or(DEFAULT_LIMIT_MPH);
            s.road_info = cached;
            s.is_cached = true;
        });

        let status = Arc::clone(&self.status);
        self.cached_flag.schedule(async move {
            status.send_modify(|s| s.is_cached = false);
        });
    }

    async fn fetch_remote(
        &self,
        fetch: &mut FetchState,
        fix: &PositionFix,
        key: GeoKey,
        now: Instant,
    ) -> CycleOutcome {
        let hint = {
            let status = self.status.borrow();
            if status.road_info.is_placeholder() {
                None
            } else {
                Some(status.road_info.road_name.clone())
            }
        };

        let result = self
            .oracle
            .fetch_road_info(
                fix.coords.latitude,
                fix.coords.longitude,
                fix.bearing,
                hint.as_deref(),
            )
            .await;

        match result {
            Ok(info) => {
                fetch.record_fetch(fix.coords, fix.bearing);
                self.status.send_modify(|s| s.error = None);

                let Some(limit) = info.limit else {
                    debug!("No limit reported for {}", key);
                    return CycleOutcome::NoLimit;
                };
                if fetch.previous_limit != Some(limit) {
                    fetch.previous_limit = Some(limit);
                    self.fire_milestone(limit);
                }
                self.apply_fresh(key, info, fix).await;
                CycleOutcome::Applied { limit }
            }
            Err(OracleError::QuotaExceeded) => {
                let cooldown = self.gate.config().quota_cooldown();
                fetch.quota_backoff_until = Some(now + cooldown);
                warn!("Oracle quota exceeded, backing off for {}s", cooldown.as_secs());
                self.status.send_modify(|s| {
                    s.error = Some(StatusError::QuotaBackoff {
                        retry_secs: cooldown.as_secs(),
                    })
                });
                CycleOutcome::QuotaBackoff
            }
            Err(e) => {
                warn!("Road lookup failed: {}", e);
                self.status.send_modify(|s| s.error = Some(StatusError::SyncError));
                CycleOutcome::Failed
            }
        }
    }

    async fn apply_fresh(&self, key: GeoKey, info: RoadInfo, fix: &PositionFix) {
        self.status.send_modify(|s| {
            s.road_info = info.clone();
            s.last_valid_limit = info.limit.unwrap_or(s.last_valid_limit);
        });
        self.cache.put(key, info.clone());

        if let Err(e) = self
            .store
            .put_json(Store::Snapshot, LAST_ROAD_INFO_KEY, &info)
            .await
        {
            warn!("Failed to store road snapshot: {}", e);
        }

        if !self.logging_enabled.load(Ordering::Relaxed) {
            return;
        }

        let record = match self.records.capture(&info, fix).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to save record locally: {}", e);
                return;
            }
        };
        match self.records.log_count().await {
            Ok(count) => self.status.send_modify(|s| s.log_count = count),
            Err(e) => warn!("Failed to read log count: {}", e),
        }

        if self.cloud_sync_enabled.load(Ordering::Relaxed) {
            if let Some(sync) = &self.sync {
                let sync = Arc::clone(sync);
                let record_id = record.record_id;
                let mut background = self.lock_background();
                while background.try_join_next().is_some() {}
                background.spawn(async move {
                    match sync.mirror(&record_id).await {
                        Ok(true) => debug!("Mirrored {}", record_id),
                        Ok(false) => debug!("{} left pending", record_id),
                        Err(e) => warn!("Mirror of {} failed: {}", record_id, e),
                    }
                });
            }
        }
    }

    /// Consume the next upcoming segment once it has been reached.
    /// Returns the limit that became current, if any.
    pub async fn on_distance_milestone(&self, traveled_miles: f64) -> Option<u32> {
        let mut fetch = self.cycle.lock().await;
        self.apply_milestone(&mut fetch, traveled_miles)
    }

    fn apply_milestone(&self, fetch: &mut FetchState, traveled_miles: f64) -> Option<u32> {
        let mut reached = None;
        self.status.send_if_modified(|s| {
            let due = s
                .road_info
                .future_segments
                .first()
                .is_some_and(|next| next.distance_miles <= traveled_miles);
            if !due {
                return false;
            }
            let segment = s.road_info.future_segments.remove(0);
            s.road_info.limit = Some(segment.limit);
            s.last_valid_limit = segment.limit;
            reached = Some(segment.limit);
            true
        });

        let limit = reached?;
        info!("Milestone reached at {:.2} mi, limit now {}", traveled_miles, limit);
        fetch.previous_limit = Some(limit);
        self.fire_milestone(limit);
        Some(limit)
    }

    fn fire_milestone(&self, limit: u32) {
        if let Some(callback) = &self.milestone {
            callback(limit);
        }
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for background mirrors started so far
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_background());
        while tasks.join_next().await.is_some() {}
    }

    /// Snapshot of the gate bookkeeping
    pub async fn fetch_state(&self) -> FetchState {
        self.cycle.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStatus;
    use crate::error::UploadError;
    use crate::queue::PendingWriteQueue;
    use crate::records::DEFAULT_RECORD_PREFIX;
    use crate::sync::ObjectUploader;
    use crate::types::{Coordinates, PredictiveSegment};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replays scripted answers, then reports itself unavailable
    struct ScriptedOracle {
        answers: StdMutex<VecDeque<Result<RoadInfo, OracleError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn new(answers: Vec<Result<RoadInfo, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: StdMutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RoadOracle for ScriptedOracle {
        async fn fetch_road_info(
            &self,
            _lat: f64,
            _lng: f64,
            _heading: f64,
            _hint: Option<&str>,
        ) -> Result<RoadInfo, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(OracleError::Unavailable("script exhausted".into())))
        }
    }

    fn road(limit: Option<u32>, segments: Vec<PredictiveSegment>) -> RoadInfo {
        RoadInfo {
            limit,
            road_name: "I-5".into(),
            road_type: "Interstate".into(),
            police_district: "CHP".into(),
            context: "Posted".into(),
            confidence: "High".into(),
            future_segments: segments,
        }
    }

    fn fix_at(lat: f64, lng: f64, bearing: f64, speed_mph: f64) -> PositionFix {
        PositionFix {
            coords: Coordinates::new(lat, lng),
            bearing,
            speed_mph,
            accuracy: 10.0,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: DurableStore,
        cache: Arc<IntelligenceCache>,
        records: Arc<RecordLog>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = DurableStore::open(dir.path().join("orch.redb")).unwrap();
        let queue = Arc::new(PendingWriteQueue::open(store.clone()).await.unwrap());
        let records = Arc::new(
            RecordLog::open(store.clone(), queue, DEFAULT_RECORD_PREFIX)
                .await
                .unwrap(),
        );
        Harness {
            _dir: dir,
            cache: Arc::new(IntelligenceCache::new(store.clone())),
            store,
            records,
        }
    }

    async fn orchestrator(h: &Harness, oracle: Arc<ScriptedOracle>) -> IntelligenceOrchestrator {
        let orch = IntelligenceOrchestrator::new(
            Arc::clone(&h.cache),
            oracle,
            Arc::clone(&h.records),
            h.store.clone(),
        );
        orch.start().await.unwrap();
        orch
    }

    #[tokio::test]
    async fn test_miss_applies_caches_and_logs() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![Ok(road(Some(65), vec![]))]);
        let orch = orchestrator(&h, oracle.clone()).await;

        let fix = fix_at(34.0, -118.0, 90.0, 20.0);
        assert_eq!(orch.on_position(&fix).await, CycleOutcome::Applied { limit: 65 });

        let status = orch.status();
        assert_eq!(status.road_info.road_name, "I-5");
        assert_eq!(status.last_valid_limit, 65);
        assert!(!status.is_updating);
        assert_eq!(status.log_count, 1);
        assert!(h.cache.contains(&geo::encode(34.0, -118.0, 90.0)));

        let snapshot: RoadInfo = h
            .store
            .get_json(Store::Snapshot, LAST_ROAD_INFO_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.limit, Some(65));
    }

    #[tokio::test]
    async fn test_logging_disabled_captures_nothing() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![Ok(road(Some(40), vec![]))]);
        let orch = orchestrator(&h, oracle).await;
        orch.set_logging_enabled(false);

        orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        assert_eq!(orch.status().log_count, 0);
        assert!(h.records.queue().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_oracle_and_clears_flag() {
        let h = harness().await;
        let key = geo::encode(34.0, -118.0, 90.0);
        h.cache.put(key, road(Some(45), vec![]));
        let oracle = ScriptedOracle::new(vec![]);
        let orch = orchestrator(&h, oracle.clone()).await;

        let outcome = orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        assert_eq!(outcome, CycleOutcome::CacheHit);
        assert_eq!(oracle.calls(), 0);

        let status = orch.status();
        assert!(status.is_cached);
        assert_eq!(status.last_valid_limit, 45);
        assert!(orch.fetch_state().await.last_fetch_coordinates.is_some());

        tokio::time::sleep(CACHED_FLAG_DURATION + Duration::from_millis(10)).await;
        assert!(!orch.status().is_cached);
    }

    #[tokio::test]
    async fn test_no_limit_adopts_nothing() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![Ok(road(None, vec![]))]);
        let orch = orchestrator(&h, oracle).await;

        let outcome = orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        assert_eq!(outcome, CycleOutcome::NoLimit);
        assert!(orch.status().road_info.is_placeholder());
        assert!(orch.fetch_state().await.last_fetch_coordinates.is_some());
        assert_eq!(h.cache.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_backoff_suppresses_next_fix() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![
            Err(OracleError::QuotaExceeded),
            Ok(road(Some(30), vec![])),
        ]);
        let orch = orchestrator(&h, oracle.clone()).await;
        let fix = fix_at(34.0, -118.0, 90.0, 20.0);

        assert_eq!(orch.on_position(&fix).await, CycleOutcome::QuotaBackoff);
        assert_eq!(
            orch.status().error_message().as_deref(),
            Some("Quota Limit - Retrying in 60s")
        );
        assert!(orch.fetch_state().await.last_fetch_coordinates.is_none());

        assert_eq!(
            orch.on_position(&fix).await,
            CycleOutcome::Skipped(GateDecision::RejectBackoff)
        );
        assert_eq!(oracle.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(orch.on_position(&fix).await, CycleOutcome::Applied { limit: 30 });
        assert!(orch.status().error.is_none());
    }

    #[tokio::test]
    async fn test_other_errors_do_not_back_off() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![
            Err(OracleError::Unavailable("timeout".into())),
            Ok(road(Some(50), vec![])),
        ]);
        let orch = orchestrator(&h, oracle).await;
        let fix = fix_at(34.0, -118.0, 90.0, 20.0);

        assert_eq!(orch.on_position(&fix).await, CycleOutcome::Failed);
        assert_eq!(orch.status().error_message().as_deref(), Some("Sync Error"));
        assert_eq!(orch.on_position(&fix).await, CycleOutcome::Applied { limit: 50 });
    }

    #[tokio::test]
    async fn test_milestone_callback_on_limit_change_only() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![
            Ok(road(Some(65), vec![])),
            Ok(road(Some(65), vec![])),
        ]);
        let chimes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&chimes);
        let orch = IntelligenceOrchestrator::new(
            Arc::clone(&h.cache),
            oracle,
            Arc::clone(&h.records),
            h.store.clone(),
        )
        .with_milestone_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        orch.start().await.unwrap();

        orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        // a sharp turn at speed refetches, same limit: no chime
        orch.on_position(&fix_at(34.0, -118.0, 180.0, 20.0)).await;
        assert_eq!(chimes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_milestones_measured_from_fetch_point() {
        let h = harness().await;
        let segments = vec![
            PredictiveSegment {
                distance_miles: 0.5,
                limit: 45,
            },
            PredictiveSegment {
                distance_miles: 1.0,
                limit: 35,
            },
        ];
        let oracle = ScriptedOracle::new(vec![Ok(road(Some(65), segments))]);
        let orch = orchestrator(&h, oracle).await;

        let origin = fix_at(34.0, -118.0, 0.0, 20.0);
        assert_eq!(orch.on_position(&origin).await, CycleOutcome::Applied { limit: 65 });

        // crawling: the gate holds, but the first segment is passed (~0.6 mi)
        let outcome = orch.on_position(&fix_at(34.0087, -118.0, 0.0, 3.0)).await;
        assert_eq!(outcome, CycleOutcome::Skipped(GateDecision::Hold));
        assert_eq!(orch.status().road_info.limit, Some(45));
        assert_eq!(
            orch.fetch_state().await.last_fetch_coordinates,
            Some(origin.coords)
        );

        // ~1.05 mi from the fetch point, only ~0.45 mi past the last pop
        orch.on_position(&fix_at(34.0152, -118.0, 0.0, 3.0)).await;
        let status = orch.status();
        assert_eq!(status.road_info.limit, Some(35));
        assert_eq!(status.last_valid_limit, 35);
        assert!(status.road_info.future_segments.is_empty());
    }

    #[tokio::test]
    async fn test_start_restores_snapshot() {
        let h = harness().await;
        h.store
            .put_json(Store::Snapshot, LAST_ROAD_INFO_KEY, &road(Some(35), vec![]))
            .await
            .unwrap();

        let orch = orchestrator(&h, ScriptedOracle::new(vec![])).await;
        let status = orch.status();
        assert_eq!(status.road_info.road_name, "I-5");
        assert_eq!(status.last_valid_limit, 35);
        assert_eq!(orch.fetch_state().await.previous_limit, Some(35));
    }

    #[tokio::test]
    async fn test_start_ignores_corrupt_snapshot() {
        let h = harness().await;
        h.store
            .put(Store::Snapshot, LAST_ROAD_INFO_KEY, b"garbage".to_vec())
            .await
            .unwrap();

        let orch = orchestrator(&h, ScriptedOracle::new(vec![])).await;
        assert!(orch.status().road_info.is_placeholder());
        assert_eq!(orch.status().last_valid_limit, DEFAULT_LIMIT_MPH);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_busy() {
        let h = harness().await;
        let orch = orchestrator(&h, ScriptedOracle::new(vec![])).await;

        let _held = orch.cycle.lock().await;
        let outcome = orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        assert_eq!(outcome, CycleOutcome::Busy);
    }

    struct AcceptingUploader;

    #[async_trait]
    impl ObjectUploader for AcceptingUploader {
        async fn upload(&self, filename: &str, _content: &str, _path: &str) -> Result<String, UploadError> {
            Ok(format!("remote/{}", filename))
        }
    }

    #[tokio::test]
    async fn test_finished_mirrors_are_reaped() {
        let h = harness().await;
        let answers = (0..20).map(|_| Ok(road(Some(65), vec![]))).collect();
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&h.records),
            Arc::new(AcceptingUploader),
            AuthStatus::new(true),
        ));
        let orch = IntelligenceOrchestrator::new(
            Arc::clone(&h.cache),
            ScriptedOracle::new(answers),
            Arc::clone(&h.records),
            h.store.clone(),
        )
        .with_sync(sync);
        orch.start().await.unwrap();
        orch.set_cloud_sync_enabled(true);

        for i in 0..20 {
            // ~0.35 mi apart, so every fix is a fresh lookup
            let fix = fix_at(34.0 + 0.005 * i as f64, -118.0, 0.0, 20.0);
            assert_eq!(orch.on_position(&fix).await, CycleOutcome::Applied { limit: 65 });
            while !h.records.queue().is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(orch.lock_background().len() <= 2);
        orch.settle().await;
        assert!(orch.lock_background().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let h = harness().await;
        let oracle = ScriptedOracle::new(vec![Ok(road(Some(70), vec![]))]);
        let orch = orchestrator(&h, oracle).await;
        let mut rx = orch.subscribe();

        orch.on_position(&fix_at(34.0, -118.0, 90.0, 20.0)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().last_valid_limit, 70);
    }
}
