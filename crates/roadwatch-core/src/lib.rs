//! ============================================================================
//! ROADWATCH-CORE: Spatial intelligence cache and sync queue
//! ============================================================================
//! Backend of the driving HUD:
//! - Bucketed geo keys and a bounded, persisted road intelligence cache
//! - Fetch gating on accuracy, motion and quota backoff
//! - Per-fix orchestration against a remote road oracle
//! - Durable, at-least-once record delivery to a remote object store
//! ============================================================================

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod gate;
pub mod geo;
pub mod orchestrator;
pub mod queue;
pub mod records;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use auth::{AuthState, AuthStatus, Subscription};
pub use cache::IntelligenceCache;
pub use config::EngineConfig;
pub use db::{DbStats, DurableStore, Store};
pub use engine::{Collaborators, Engine};
pub use error::{OracleError, StatusError, StorageError, UploadError};
pub use gate::{FetchGate, FetchState, GateConfig, GateDecision, MotionSample};
pub use geo::GeoKey;
pub use orchestrator::{CycleOutcome, IntelligenceOrchestrator, MilestoneCallback, RoadOracle};
pub use queue::PendingWriteQueue;
pub use records::RecordLog;
pub use sync::{DrainReport, ObjectUploader, SyncCoordinator};
