//! ============================================================================
//! Error Types - Storage, oracle, upload and user-visible status errors
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Failure of the durable key-value store.
/// Callers treat any of these as "the operation did not happen".
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage engine error: {0}")]
    Engine(String),

    #[error("Corrupt persisted data: {0}")]
    Serialization(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn engine(e: impl std::fmt::Display) -> Self {
        Self::Engine(e.to_string())
    }

    pub(crate) fn serialization(e: impl std::fmt::Display) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Failure reported by a [`crate::RoadOracle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// Rate limit hit (HTTP 429 or equivalent); triggers the quota cooldown
    #[error("QUOTA_EXCEEDED")]
    QuotaExceeded,

    #[error("Road oracle unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by an [`crate::ObjectUploader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("Not Authenticated")]
    NotAuthenticated,

    #[error("Upload failed: {0}")]
    Failed(String),
}

/// Transient, user-visible error state surfaced on the HUD status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum StatusError {
    #[error("Quota Limit - Retrying in {retry_secs}s")]
    QuotaBackoff { retry_secs: u64 },

    #[error("Sync Error")]
    SyncError,
}
