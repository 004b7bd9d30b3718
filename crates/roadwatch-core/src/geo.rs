//! ============================================================================
//! Geo Utilities - Cache keys, distance and bearing
//! ============================================================================
//! A GeoKey buckets a fix into a zoom-19 Web-Mercator tile (~20 m) plus a
//! 22.5° heading sector, so nearby fixes travelling the same way share a
//! cache entry. Keys are plain strings and stable across restarts.
//! ============================================================================

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Coordinates;

/// Tile zoom level used for cache keys
pub const KEY_ZOOM: u32 = 19;

/// Width of one heading bucket in degrees
pub const HEADING_STEP_DEG: f64 = 22.5;

/// Mean earth radius in miles
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Bucketed spatial + heading identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoKey(String);

impl GeoKey {
    /// Wrap an already-encoded key (e.g. one read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode a fix into its cache key.
/// Inputs must be finite; NaN/Infinity produce an unspecified key.
pub fn encode(lat: f64, lng: f64, heading: f64) -> GeoKey {
    let n = f64::from(1u32 << KEY_ZOOM);
    let x_tile = ((lng + 180.0) / 360.0 * n).floor() as i64;
    let lat_rad = lat.to_radians();
    let y_tile =
        ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor() as i64;

    GeoKey(format!(
        "Z{}-X{}-Y{}-HDG{}",
        KEY_ZOOM,
        x_tile,
        y_tile,
        heading_bucket(heading)
    ))
}

/// Round a heading to the nearest 22.5° multiple, modulo 360.
/// Halves round up, so 11.25° lands in the 22.5° bucket.
pub fn heading_bucket(heading: f64) -> f64 {
    let bucket = (heading / HEADING_STEP_DEG + 0.5).floor() * HEADING_STEP_DEG % 360.0;
    // normalise -0.0 so it prints as "0"
    bucket + 0.0
}

/// Great-circle (haversine) distance in miles
pub fn distance_miles(a: &Coordinates, b: &Coordinates) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_MILES * c
}

/// Initial bearing from `from` to `to`, degrees in [0, 360).
/// Used by [`crate::PositionFix::from_sensor`] when the sensor reports no heading.
pub fn initial_bearing(from: &Coordinates, to: &Coordinates) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}
