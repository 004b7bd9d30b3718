//! ============================================================================
//! Database Types - Namespaces and statistics for the redb store
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Disjoint namespaces of the durable store.
/// Each one is its own redb table so components never collide on keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Store {
    /// GeoKey -> cached road intelligence
    Intelligence,
    /// Record id -> captured PendingRecord
    Records,
    /// Pending index, migration markers, counters, legacy blobs
    Meta,
    /// Single-slot last-known-good road info
    Snapshot,
}

impl Store {
    pub const COUNT: usize = 4;

    pub const ALL: [Store; Store::COUNT] = [Store::Intelligence, Store::Records, Store::Meta, Store::Snapshot];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Intelligence => "road_intelligence",
            Self::Records => "records",
            Self::Meta => "meta",
            Self::Snapshot => "snapshot",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Intelligence => 0,
            Self::Records => 1,
            Self::Meta => 2,
            Self::Snapshot => 3,
        }
    }
}

/// Entry counts and committed write transactions per namespace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub entries: BTreeMap<String, usize>,
    pub commits: BTreeMap<String, u64>,
}
