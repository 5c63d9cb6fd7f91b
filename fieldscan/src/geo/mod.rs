//! Spherical geometry primitives.
//!
//! Provides the great-circle math the scanning core is built on: destination
//! points from a bearing and distance, two distance approximations with
//! different accuracy/cost trade-offs, spherical interpolation for centroid
//! updates, and a bounded random jitter for scan positions.
//!
//! Distances are in kilometres and angles in degrees unless noted otherwise.

use std::f64::consts::PI;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius used by all spherical math, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Minimum valid latitude in degrees.
pub const MIN_LAT: f64 = -90.0;

/// Maximum valid latitude in degrees.
pub const MAX_LAT: f64 = 90.0;

/// Minimum valid longitude in degrees.
pub const MIN_LNG: f64 = -180.0;

/// Maximum valid longitude in degrees.
pub const MAX_LNG: f64 = 180.0;

/// Errors for invalid geographic input.
#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    /// Latitude outside [-90, 90].
    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),

    /// Longitude outside [-180, 180].
    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),
}

/// A geographic position with altitude.
///
/// Altitude is carried through the scheduling pipeline unchanged; it is only
/// meaningful to the remote client, which expects a plausible value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Altitude in metres.
    pub alt: f64,
}

impl Location {
    /// Creates a location at the given coordinates with zero altitude.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng, alt: 0.0 }
    }

    /// Creates a location with an explicit altitude.
    pub fn with_alt(lat: f64, lng: f64, alt: f64) -> Self {
        Self { lat, lng, alt }
    }

    /// Validates the latitude/longitude ranges.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !(MIN_LAT..=MAX_LAT).contains(&self.lat) {
            return Err(GeoError::InvalidLatitude(self.lat));
        }
        if !(MIN_LNG..=MAX_LNG).contains(&self.lng) {
            return Err(GeoError::InvalidLongitude(self.lng));
        }
        Ok(())
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Computes the destination point from `origin` after travelling
/// `distance_km` along the initial bearing `bearing_deg`.
///
/// Standard great-circle destination formula on a sphere of radius
/// [`EARTH_RADIUS_KM`]. The origin's altitude is preserved.
pub fn offset(origin: &Location, distance_km: f64, bearing_deg: f64) -> Location {
    let ang = distance_km / EARTH_RADIUS_KM;
    let bearing = bearing_deg.to_radians();

    let lat1 = origin.lat.to_radians();
    let lng1 = origin.lng.to_radians();

    let lat2 = (lat1.sin() * ang.cos() + lat1.cos() * ang.sin() * bearing.cos()).asin();
    let lng2 = lng1
        + (bearing.sin() * ang.sin() * lat1.cos()).atan2(ang.cos() - lat1.sin() * lat2.sin());

    // Normalise longitude to [-180, 180).
    let lng2 = (lng2 + 3.0 * PI) % (2.0 * PI) - PI;

    Location {
        lat: lat2.to_degrees(),
        lng: lng2.to_degrees(),
        alt: origin.alt,
    }
}

/// Equirectangular distance approximation between two points, in kilometres.
///
/// Accurate enough for the short ranges this system cares about (cluster
/// radii and account cooldowns, tens of metres to a few kilometres) and much
/// cheaper than the haversine form.
pub fn equirect_distance(a: &Location, b: &Location) -> f64 {
    let x = (b.lng.to_radians() - a.lng.to_radians())
        * (0.5 * (b.lat.to_radians() + a.lat.to_radians())).cos();
    let y = b.lat.to_radians() - a.lat.to_radians();
    EARTH_RADIUS_KM * (x * x + y * y).sqrt()
}

/// Exact great-circle (haversine) distance between two points, in kilometres.
///
/// Used where the result feeds a hard constraint (the planner's travel-speed
/// checks) rather than a heuristic.
pub fn haversine_distance(a: &Location, b: &Location) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    EARTH_RADIUS_KM * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Point a `fraction` of the way along the great circle from `a` to `b`.
///
/// `fraction` 0.0 returns `a`, 1.0 returns `b`. Coincident endpoints short
/// circuit to `a`.
pub fn intermediate_point(a: &Location, b: &Location, fraction: f64) -> Location {
    let lat1 = a.lat.to_radians();
    let lng1 = a.lng.to_radians();
    let lat2 = b.lat.to_radians();
    let lng2 = b.lng.to_radians();

    let delta = haversine_distance(a, b) / EARTH_RADIUS_KM;
    if delta == 0.0 || delta.sin() == 0.0 {
        return *a;
    }

    let fa = (((1.0 - fraction) * delta).sin()) / delta.sin();
    let fb = ((fraction * delta).sin()) / delta.sin();

    let x = fa * lat1.cos() * lng1.cos() + fb * lat2.cos() * lng2.cos();
    let y = fa * lat1.cos() * lng1.sin() + fb * lat2.cos() * lng2.sin();
    let z = fa * lat1.sin() + fb * lat2.sin();

    Location {
        lat: z.atan2((x * x + y * y).sqrt()).to_degrees(),
        lng: y.atan2(x).to_degrees(),
        alt: a.alt,
    }
}

/// Applies a random offset of at most `max_metres` to a location.
///
/// The offset is uniform over the disc (square-root distributed radius,
/// uniform bearing), so repeated scans from the same worker never sit on
/// the exact same coordinates.
pub fn jitter<R: Rng>(location: &Location, max_metres: f64, rng: &mut R) -> Location {
    let bearing = rng.random_range(0.0..360.0);
    let distance_km = rng.random::<f64>().sqrt() * (max_metres / 1000.0);
    offset(location, distance_km, bearing)
}
