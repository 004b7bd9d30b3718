//! ============================================================================
//! Fetch Gate - When is a remote road lookup worth making
//! ============================================================================
//! Pure policy over the current fix and the last-fetch state:
//! - Noisy fixes never overwrite road data we already have
//! - Nothing is fetched during a quota cooldown
//! - The first fix always fetches
//! - Afterwards only a moving vehicle that turned or travelled refetches
//!
//! All thresholds are exclusive.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::geo::distance_miles;
use crate::types::{Coordinates, PositionFix};

/// Gate thresholds (defaults match the HUD's tuning)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Fixes less accurate than this are ignored once data exists
    pub max_accuracy_meters: f64,
    /// Below (or at) this speed the vehicle counts as stationary
    pub min_speed_mph: f64,
    /// Distance from the last fetch point that warrants a refetch
    pub min_travel_miles: f64,
    /// Bearing change strictly between these two values is a turn
    pub turn_min_degrees: f64,
    pub turn_max_degrees: f64,
    /// Cooldown after the oracle reports a quota error
    pub quota_cooldown_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_accuracy_meters: 50.0,
            min_speed_mph: 5.0,
            min_travel_miles: 0.25,
            turn_min_degrees: 35.0,
            turn_max_degrees: 325.0,
            quota_cooldown_secs: 60,
        }
    }
}

impl GateConfig {
    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_cooldown_secs)
    }
}

/// Motion inputs the gate looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub coords: Coordinates,
    pub bearing: f64,
    pub speed_mph: f64,
    pub accuracy_meters: f64,
}

impl From<&PositionFix> for MotionSample {
    fn from(fix: &PositionFix) -> Self {
        Self {
            coords: fix.coords,
            bearing: fix.bearing,
            speed_mph: fix.speed_mph,
            accuracy_meters: fix.accuracy,
        }
    }
}

/// Per-session fetch bookkeeping. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    pub last_fetch_coordinates: Option<Coordinates>,
    pub last_fetch_bearing: f64,
    pub quota_backoff_until: Option<Instant>,
    pub previous_limit: Option<u32>,
}

impl FetchState {
    pub fn record_fetch(&mut self, coords: Coordinates, bearing: f64) {
        self.last_fetch_coordinates = Some(coords);
        self.last_fetch_bearing = bearing;
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.quota_backoff_until.is_some_and(|until| now < until)
    }

    /// Miles from the last fetch point, or `None` before the first fetch
    pub fn traveled_since_fetch(&self, coords: &Coordinates) -> Option<f64> {
        self.last_fetch_coordinates
            .as_ref()
            .map(|last| distance_miles(coords, last))
    }
}

/// Why the gate decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Low-accuracy fix while road data exists
    RejectNoisy,
    /// Inside the quota cooldown window
    RejectBackoff,
    /// No fetch has happened yet
    Bootstrap,
    /// Moving and turned or travelled far enough
    Refresh,
    /// Stationary, or moving without a turn or enough travel
    Hold,
}

impl GateDecision {
    pub fn allows_fetch(&self) -> bool {
        matches!(self, Self::Bootstrap | Self::Refresh)
    }
}

/// Fetch policy evaluator
#[derive(Debug, Clone, Default)]
pub struct FetchGate {
    config: GateConfig,
}

impl FetchGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluate the policy, in order
    pub fn evaluate(
        &self,
        current: &MotionSample,
        state: &FetchState,
        have_any_data: bool,
        now: Instant,
    ) -> GateDecision {
        if current.accuracy_meters > self.config.max_accuracy_meters && have_any_data {
            return GateDecision::RejectNoisy;
        }

        if state.in_backoff(now) {
            return GateDecision::RejectBackoff;
        }

        let Some(last) = state.last_fetch_coordinates.as_ref() else {
            return GateDecision::Bootstrap;
        };

        let distance = distance_miles(&current.coords, last);
        // literal difference: 359° vs 2° is not a turn
        let bearing_change = (current.bearing - state.last_fetch_bearing).abs();
        let is_turn = bearing_change > self.config.turn_min_degrees
            && bearing_change < self.config.turn_max_degrees;
        let is_moving = current.speed_mph > self.config.min_speed_mph;
        let has_travelled = distance > self.config.min_travel_miles;

        if is_moving && (is_turn || has_travelled) {
            GateDecision::Refresh
        } else {
            GateDecision::Hold
        }
    }

    pub fn should_fetch(
        &self,
        current: &MotionSample,
        state: &FetchState,
        have_any_data: bool,
        now: Instant,
    ) -> bool {
        self.evaluate(current, state, have_any_data, now).allows_fetch()
    }
}
