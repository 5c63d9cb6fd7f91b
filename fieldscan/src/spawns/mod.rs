//! Spawn-point model and time projection.
//!
//! A spawn point is a location with an hour-periodic event: something appears
//! there at a fixed number of seconds past every hour and stays visible for a
//! fixed duration. The scheduling cycle works in "seconds past the hour"
//! space and projects onto absolute timestamps once per cycle, because the
//! relative geometry never changes but the absolute times do.
//!
//! Input is a plain JSON array of `{lat, lng, spawnpoint_id, time}` records,
//! typically exported by an earlier survey scan.

pub mod cluster;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geo::Location;

/// How long a spawned event remains visible, in seconds.
pub const VISIBLE_DURATION_SECS: u64 = 900;

/// Errors loading spawn points from an external source.
#[derive(Debug, Error)]
pub enum SpawnSourceError {
    /// The spawn file could not be opened or read.
    #[error("failed to read spawn file: {0}")]
    Io(#[from] std::io::Error),

    /// The spawn file is not valid JSON of the expected shape.
    #[error("failed to parse spawn file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A known spawn location with its hour-periodic appearance time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// Stable identifier from the survey data.
    #[serde(rename = "spawnpoint_id")]
    pub id: String,

    /// Latitude in degrees.
    pub lat: f64,

    /// Longitude in degrees.
    pub lng: f64,

    /// Appearance time as seconds past the hour (0..3600).
    #[serde(rename = "time")]
    pub time_of_hour: u32,
}

impl SpawnPoint {
    /// The spawn's position as a [`Location`] (zero altitude).
    pub fn location(&self) -> Location {
        Location::new(self.lat, self.lng)
    }
}

/// Absolute appearance window for one projected spawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpawnWindow {
    /// Unix timestamp at which the event appears.
    pub appears_at: u64,
    /// Unix timestamp at which the event leaves. Always
    /// `appears_at + VISIBLE_DURATION_SECS`.
    pub leaves_at: u64,
}

/// Seconds past the current hour for a unix timestamp.
pub fn seconds_past_hour(now_unix: u64) -> u32 {
    (now_unix % 3600) as u32
}

/// Projects an hour-relative appearance time onto the current or next hour.
///
/// If the event's time this hour is still ahead of `now`, the window lands
/// in the current hour; otherwise it rolls over to the next one.
pub fn project_on_hour(time_of_hour: u32, now_unix: u64) -> SpawnWindow {
    project_with_lookback(time_of_hour, now_unix, 0)
}

/// Projects with a lookback window so already-started events stay current.
///
/// With `lookback_secs == VISIBLE_DURATION_SECS`, an event that appeared up
/// to 15 minutes ago projects into the recent past instead of rolling over
/// to the next hour — the first fill after startup, pause, or relocation
/// uses this so currently-visible events still get scanned.
pub fn project_with_lookback(time_of_hour: u32, now_unix: u64, lookback_secs: u32) -> SpawnWindow {
    let cur = seconds_past_hour(now_unix) as i64;
    let shifted = ((time_of_hour + lookback_secs) % 3600) as i64;
    let now = now_unix as i64;

    let appears = if shifted > cur {
        now + (shifted - cur) - lookback_secs as i64
    } else {
        now + 3600 - (cur - shifted) - lookback_secs as i64
    };

    let appears = appears.max(0) as u64;
    SpawnWindow {
        appears_at: appears,
        leaves_at: appears + VISIBLE_DURATION_SECS,
    }
}

/// Loads spawn points from a JSON file.
///
/// Records with out-of-range coordinates or appearance times are dropped
/// with a warning rather than failing the whole load; a survey file with a
/// few bad rows is still worth scanning.
pub fn load_spawn_file(path: &Path) -> Result<Vec<SpawnPoint>, SpawnSourceError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: Vec<SpawnPoint> = serde_json::from_str(&raw)?;

    let total = parsed.len();
    let spawns: Vec<SpawnPoint> = parsed
        .into_iter()
        .filter(|sp| {
            let valid = sp.location().validate().is_ok() && sp.time_of_hour < 3600;
            if !valid {
                warn!(
                    id = %sp.id,
                    lat = sp.lat,
                    lng = sp.lng,
                    time = sp.time_of_hour,
                    "Dropping invalid spawn record"
                );
            }
            valid
        })
        .collect();

    if spawns.len() < total {
        warn!(
            dropped = total - spawns.len(),
            kept = spawns.len(),
            "Spawn file contained invalid records"
        );
    }

    Ok(spawns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spawn(id: &str, time: u32) -> SpawnPoint {
        SpawnPoint {
            id: id.to_string(),
            lat: 37.5308,
            lng: -122.2881,
            time_of_hour: time,
        }
    }

    #[test]
    fn test_seconds_past_hour() {
        assert_eq!(seconds_past_hour(3600), 0);
        assert_eq!(seconds_past_hour(3725), 125);
        assert_eq!(seconds_past_hour(7199), 3599);
    }

    #[test]
    fn test_project_future_this_hour() {
        // now = 100s past the hour, spawn at 500s -> appears 400s from now.
        let now = 720_000_100;
        let window = project_on_hour(500, now);
        assert_eq!(window.appears_at, now + 400);
        assert_eq!(window.leaves_at, now + 400 + VISIBLE_DURATION_SECS);
    }

    #[test]
    fn test_project_rolls_to_next_hour() {
        // now = 500s past the hour, spawn at 100s -> 3200s from now.
        let now = 720_000_500;
        let window = project_on_hour(100, now);
        assert_eq!(window.appears_at, now + 3600 - 400);
    }

    #[test]
    fn test_project_exact_boundary_rolls_over() {
        // A spawn exactly at the current second counts as missed this hour.
        let now = 720_000_500;
        let window = project_on_hour(500, now);
        assert_eq!(window.appears_at, now + 3600);
    }

    #[test]
    fn test_project_window_duration_invariant() {
        for time in [0u32, 100, 1800, 3599] {
            let window = project_on_hour(time, 720_000_123);
            assert_eq!(
                window.leaves_at - window.appears_at,
                VISIBLE_DURATION_SECS
            );
        }
    }

    #[test]
    fn test_project_with_lookback_keeps_started_event_current() {
        // Spawn appeared 300s ago; with a 900s lookback the window projects
        // into the recent past rather than next hour.
        let now = 720_000_500;
        let window = project_with_lookback(200, now, VISIBLE_DURATION_SECS as u32);
        assert_eq!(window.appears_at, now - 300);
        assert!(window.leaves_at > now);
    }

    #[test]
    fn test_project_with_lookback_matches_plain_for_future() {
        // An event still ahead in the hour projects identically either way,
        // as long as the lookback does not push it across the hour boundary.
        let now = 720_000_100;
        let plain = project_on_hour(500, now);
        let lookback = project_with_lookback(500, now, 300);
        assert_eq!(plain, lookback);
    }

    #[test]
    fn test_load_spawn_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"lat": 37.5308, "lng": -122.2881, "spawnpoint_id": "808f9f1601d", "time": 511}},
                {{"lat": 37.5310, "lng": -122.2879, "spawnpoint_id": "808f9f1601f", "time": 1890}}
            ]"#
        )
        .unwrap();

        let spawns = load_spawn_file(file.path()).unwrap();
        assert_eq!(spawns.len(), 2);
        assert_eq!(spawns[0].id, "808f9f1601d");
        assert_eq!(spawns[0].time_of_hour, 511);
    }

    #[test]
    fn test_load_spawn_file_drops_invalid_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"lat": 37.5308, "lng": -122.2881, "spawnpoint_id": "good", "time": 511}},
                {{"lat": 95.0, "lng": -122.2881, "spawnpoint_id": "bad-lat", "time": 511}},
                {{"lat": 37.5308, "lng": -122.2881, "spawnpoint_id": "bad-time", "time": 4000}}
            ]"#
        )
        .unwrap();

        let spawns = load_spawn_file(file.path()).unwrap();
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0].id, "good");
    }

    #[test]
    fn test_load_spawn_file_missing() {
        let err = load_spawn_file(Path::new("/nonexistent/spawns.json"));
        assert!(matches!(err, Err(SpawnSourceError::Io(_))));
    }

    #[test]
    fn test_load_spawn_file_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_spawn_file(file.path());
        assert!(matches!(err, Err(SpawnSourceError::Parse(_))));
    }

    #[test]
    fn test_spawn_point_location() {
        let sp = spawn("x", 10);
        let loc = sp.location();
        assert_eq!(loc.lat, 37.5308);
        assert_eq!(loc.lng, -122.2881);
    }
}
