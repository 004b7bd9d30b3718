//! ============================================================================
//! Core Types for Roadwatch
//! ============================================================================
//! Road intelligence results, position fixes, captured records and the
//! status snapshot handed to the HUD. Road data keeps the camelCase field
//! names used by the oracle and by older persisted blobs.
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::StatusError;
use crate::geo;

/// Speed limit shown before any road data has arrived
pub const DEFAULT_LIMIT_MPH: u32 = 25;

/// Road name carried by the placeholder [`RoadInfo`]
pub const INITIALIZING_ROAD_NAME: &str = "Initializing...";

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// An upcoming speed limit change along the current road
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictiveSegment {
    /// Distance from the fetch point, in miles
    pub distance_miles: f64,
    pub limit: u32,
}

/// Road intelligence for one location and heading.
/// Replaced wholesale on every lookup; only `future_segments` is consumed
/// from the front as milestones are passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadInfo {
    pub limit: Option<u32>,
    #[serde(default)]
    pub road_name: String,
    #[serde(default)]
    pub road_type: String,
    #[serde(default)]
    pub police_district: String,
    /// Human-readable provenance of the data
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub confidence: String,
    /// Ordered by increasing distance, nearest first
    #[serde(default)]
    pub future_segments: Vec<PredictiveSegment>,
}

impl RoadInfo {
    /// Placeholder used until the first lookup or snapshot is available
    pub fn initializing() -> Self {
        Self {
            limit: Some(DEFAULT_LIMIT_MPH),
            road_name: INITIALIZING_ROAD_NAME.to_string(),
            road_type: "Ready".to_string(),
            police_district: String::new(),
            context: "Establishing GPS link...".to_string(),
            confidence: "Scanning".to_string(),
            future_segments: Vec::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.road_name == INITIALIZING_ROAD_NAME
    }
}

/// One GPS reading as delivered by the sensor layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub coords: Coordinates,
    /// Heading in degrees, [0, 360)
    pub bearing: f64,
    pub speed_mph: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
}

impl PositionFix {
    /// Build a fix from raw sensor values. A missing heading is derived
    /// from the previous position, or 0 when there is none.
    pub fn from_sensor(
        coords: Coordinates,
        heading: Option<f64>,
        speed_mph: f64,
        accuracy: f64,
        previous: Option<&Coordinates>,
    ) -> Self {
        let bearing = match (heading, previous) {
            (Some(heading), _) => heading,
            (None, Some(previous)) => geo::initial_bearing(previous, &coords),
            (None, None) => 0.0,
        };
        Self {
            coords,
            bearing,
            speed_mph,
            accuracy,
        }
    }
}

/// Sensor telemetry attached to a captured record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub bearing: f64,
    pub gps_accuracy: f64,
    pub gps_timestamp_ms: i64,
}

/// Road data plus the telemetry it was captured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    #[serde(flatten)]
    pub road: RoadInfo,
    pub telemetry: Telemetry,
}

/// A locally captured observation awaiting upload.
/// `synced == false` exactly when `record_id` is in the pending index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// `path` + `filename`
    pub record_id: String,
    /// `<prefix>/<YYYY>/<MM>/<DD>/<road>/`
    pub path: String,
    pub filename: String,
    /// RFC 3339 capture time
    pub timestamp: String,
    pub coordinates: Coordinates,
    pub context: String,
    pub accuracy: f64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub remote_id: Option<String>,
    pub payload: RecordPayload,
}

/// Snapshot of everything the HUD renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HudStatus {
    pub road_info: RoadInfo,
    /// Last non-null limit seen
    pub last_valid_limit: u32,
    /// Set for a few seconds after a cache hit
    pub is_cached: bool,
    pub is_updating: bool,
    pub error: Option<StatusError>,
    /// Records ever captured
    pub log_count: u64,
}

impl HudStatus {
    pub fn new(road_info: RoadInfo, log_count: u64) -> Self {
        let last_valid_limit = road_info.limit.unwrap_or(DEFAULT_LIMIT_MPH);
        Self {
            road_info,
            last_valid_limit,
            is_cached: false,
            is_updating: false,
            error: None,
            log_count,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}
