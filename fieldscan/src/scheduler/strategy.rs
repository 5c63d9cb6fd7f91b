//! Target-generation strategies.
//!
//! Strategies decide which locations get scanned, in what order, at what
//! time. They are a tagged variant dispatched through one small contract —
//! `schedule`, `location_changed`, `scanning_paused` — so the overseer and
//! worker code never change when a new strategy is added.
//!
//! Queue items carry an optional validity window. Strategies without timing
//! (the hex lattice) leave it unset; spawn-based strategies project each
//! point's hour-relative appearance onto absolute timestamps at every fill,
//! because the projection goes stale each hour while the geometry does not.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{HexGridConfig, ScanConfig, ScanMode};
use crate::geo::Location;
use crate::planner::{self, AssignmentOutcome, PlannerConfig};
use crate::queue::SharedQueue;
use crate::spawns::cluster::cluster_spawn_points;
use crate::spawns::{
    project_with_lookback, seconds_past_hour, SpawnPoint, VISIBLE_DURATION_SECS,
};
use crate::steps;

use super::ScanTarget;

/// Altitude attached to queued scan targets, metres.
///
/// The remote service expects a plausible non-zero altitude.
pub const SCAN_ALTITUDE_M: f64 = 40.32;

/// A target-generation strategy, selected at construction from config.
pub enum ScanStrategy {
    /// Static concentric hex lattice.
    HexGrid(HexGridStrategy),
    /// Spawn points in appearance order.
    SpawnTimed(SpawnTimedStrategy),
    /// Spawn points packed onto lanes under the travel-speed limit.
    SpeedLimited(SpeedLimitedStrategy),
}

impl ScanStrategy {
    /// Builds the strategy named by `config.mode`.
    ///
    /// `spawn_points` is the survey data for the spawn-based modes; the
    /// plain hex grid ignores it.
    pub fn from_config(config: &ScanConfig, spawn_points: Vec<SpawnPoint>) -> Self {
        let spawn_points = if config.spawns.cluster && config.mode.needs_spawn_data() {
            cluster_spawn_points(
                &spawn_points,
                config.spawns.cluster_radius_m,
                config.spawns.cluster_time_threshold_secs,
            )
        } else {
            spawn_points
        };

        match config.mode {
            ScanMode::HexGrid => Self::HexGrid(HexGridStrategy::new(
                config.hex.clone(),
                config.center,
                false,
                Vec::new(),
            )),
            ScanMode::HexGridSpawnpointsOnly => Self::HexGrid(HexGridStrategy::new(
                config.hex.clone(),
                config.center,
                true,
                spawn_points,
            )),
            ScanMode::SpawnTimed => {
                Self::SpawnTimed(SpawnTimedStrategy::new(spawn_points))
            }
            ScanMode::SpawnTimedSpeedLimited => Self::SpeedLimited(SpeedLimitedStrategy::new(
                spawn_points,
                config.planner_config(),
            )),
        }
    }

    /// Fills the queue with one cycle's worth of targets.
    ///
    /// `include_current` asks spawn-based strategies to also project events
    /// whose window already started (first fill after startup, pause, or
    /// relocation). Returns the number of targets enqueued.
    pub fn schedule(
        &mut self,
        queue: &Arc<SharedQueue<ScanTarget>>,
        now_unix: u64,
        include_current: bool,
    ) -> usize {
        match self {
            Self::HexGrid(s) => s.schedule(queue),
            Self::SpawnTimed(s) => s.schedule(queue, now_unix, include_current),
            Self::SpeedLimited(s) => s.schedule(queue, now_unix, include_current),
        }
    }

    /// Reacts to a scan-center change.
    pub fn location_changed(&mut self, location: Location) {
        match self {
            Self::HexGrid(s) => s.location_changed(location),
            Self::SpawnTimed(s) => s.location_changed(location),
            Self::SpeedLimited(s) => s.location_changed(location),
        }
    }

    /// Reacts to scanning being paused. Queue draining is the overseer's
    /// job; strategies only reset per-cycle state here.
    pub fn scanning_paused(&mut self) {
        if let Self::HexGrid(s) = self {
            s.scanning_paused();
        }
    }

    /// Whether this strategy attaches validity windows to its targets.
    pub fn is_time_windowed(&self) -> bool {
        !matches!(self, Self::HexGrid(_))
    }
}

// =============================================================================
// Hex grid
// =============================================================================

/// Static hex-lattice strategy.
///
/// The lattice is a pure function of the center, so it is generated once
/// and reused every cycle until the center moves.
pub struct HexGridStrategy {
    config: HexGridConfig,
    center: Option<Location>,
    spawnpoints_only: bool,
    spawn_points: Vec<SpawnPoint>,
    cached: Option<Vec<ScanTarget>>,
}

impl HexGridStrategy {
    fn new(
        config: HexGridConfig,
        center: Option<Location>,
        spawnpoints_only: bool,
        spawn_points: Vec<SpawnPoint>,
    ) -> Self {
        Self {
            config,
            center,
            spawnpoints_only,
            spawn_points,
            cached: None,
        }
    }

    fn generate(&self, center: &Location) -> Vec<ScanTarget> {
        let mut locations =
            steps::generate(center, self.config.ring_count, self.config.step_distance_km);
        steps::front_load_center(&mut locations, self.config.ring_count);

        if self.spawnpoints_only {
            if self.spawn_points.is_empty() {
                warn!(
                    "No spawn points known in the scan area; did a survey scan run here first?"
                );
            }
            locations = steps::filter_by_spawn_proximity(
                locations,
                &self.spawn_points,
                self.config.spawn_proximity_m,
            );
        }

        locations
            .into_iter()
            .enumerate()
            .map(|(i, loc)| ScanTarget {
                step: i + 1,
                location: Location::with_alt(loc.lat, loc.lng, SCAN_ALTITUDE_M),
                appears_at: None,
                leaves_at: None,
            })
            .collect()
    }

    fn schedule(&mut self, queue: &Arc<SharedQueue<ScanTarget>>) -> usize {
        let Some(center) = self.center else {
            warn!("Cannot schedule work until scan location has been set");
            return 0;
        };

        if self.cached.is_none() {
            self.cached = Some(self.generate(&center));
        }

        let targets = self.cached.as_ref().expect("cache filled above").clone();
        for target in &targets {
            debug!(step = target.step, location = %target.location, "Queuing step");
        }
        queue.extend(targets)
    }

    fn location_changed(&mut self, location: Location) {
        self.center = Some(location);
        self.cached = None;
    }

    fn scanning_paused(&mut self) {
        // The lattice survives a pause; nothing to reset.
    }
}

// =============================================================================
// Spawn timed
// =============================================================================

/// Appearance-ordered spawn strategy.
///
/// Recomputes the projection every fill: the spawn list is stable but the
/// absolute timestamps roll forward each hour.
pub struct SpawnTimedStrategy {
    spawn_points: Vec<SpawnPoint>,
}

impl SpawnTimedStrategy {
    fn new(spawn_points: Vec<SpawnPoint>) -> Self {
        info!(spawns = spawn_points.len(), "Total spawns to track");
        Self { spawn_points }
    }

    fn schedule(
        &mut self,
        queue: &Arc<SharedQueue<ScanTarget>>,
        now_unix: u64,
        include_current: bool,
    ) -> usize {
        let lookback = if include_current {
            VISIBLE_DURATION_SECS as u32
        } else {
            0
        };

        let mut projected: Vec<(SpawnPoint, u64, u64)> = self
            .spawn_points
            .iter()
            .map(|sp| {
                let window = project_with_lookback(sp.time_of_hour, now_unix, lookback);
                (sp.clone(), window.appears_at, window.leaves_at)
            })
            .collect();
        projected.sort_by_key(|(_, appears, _)| *appears);

        let targets: Vec<ScanTarget> = projected
            .into_iter()
            .enumerate()
            .map(|(i, (sp, appears, leaves))| ScanTarget {
                step: i + 1,
                location: Location::with_alt(sp.lat, sp.lng, SCAN_ALTITUDE_M),
                appears_at: Some(appears + planner::GRACE_SECS as u64),
                leaves_at: Some(leaves),
            })
            .collect();

        queue.extend(targets)
    }

    fn location_changed(&mut self, _location: Location) {
        // The spawn survey covers the whole area of interest; a relocation
        // only restarts the cycle, which the overseer handles by draining.
    }
}

// =============================================================================
// Speed limited
// =============================================================================

/// Speed-limited lane strategy.
///
/// The lane assignment is computed once and cached — geometry and ordering
/// are invariant across hours — while scan times are re-projected onto the
/// current hour every fill.
pub struct SpeedLimitedStrategy {
    spawn_points: Vec<SpawnPoint>,
    planner_config: PlannerConfig,
    plan: Option<AssignmentOutcome>,
}

impl SpeedLimitedStrategy {
    fn new(spawn_points: Vec<SpawnPoint>, planner_config: PlannerConfig) -> Self {
        Self {
            spawn_points,
            planner_config,
            plan: None,
        }
    }

    fn ensure_plan(&mut self) -> &AssignmentOutcome {
        if self.plan.is_none() {
            let outcome = planner::assign(&self.spawn_points, &self.planner_config);

            if !outcome.unassignable.is_empty() {
                info!(
                    count = outcome.unassignable.len(),
                    "Cannot schedule spawn points under max delay, dropping"
                );
            }
            if outcome.delays.is_empty() {
                info!("No additional delay added to any spawn point");
            } else {
                info!(
                    delayed = outcome.delays.len(),
                    average = format!("{:.2}", outcome.average_delay()),
                    max = format!("{:.2}", outcome.max_delay()),
                    "Scan delays incurred by lane assignment"
                );
            }

            self.plan = Some(outcome);
        }
        self.plan.as_ref().expect("plan computed above")
    }

    fn schedule(
        &mut self,
        queue: &Arc<SharedQueue<ScanTarget>>,
        now_unix: u64,
        include_current: bool,
    ) -> usize {
        let lookback = if include_current {
            VISIBLE_DURATION_SECS as f64
        } else {
            0.0
        };
        let cur = seconds_past_hour(now_unix) as f64;
        let plan = self.ensure_plan();

        let mut targets: Vec<(f64, ScanTarget)> = plan
            .planned
            .iter()
            .enumerate()
            .map(|(i, planned)| {
                let scan_abs = now_unix as f64
                    + (planned.scan_time_of_hour - cur + lookback).rem_euclid(3600.0)
                    - lookback;
                let leaves_abs = now_unix as f64
                    + (planned.spawn.time_of_hour as f64 - cur + lookback).rem_euclid(3600.0)
                    - lookback
                    + VISIBLE_DURATION_SECS as f64;

                let target = ScanTarget {
                    step: i + 1,
                    location: Location::with_alt(
                        planned.spawn.lat,
                        planned.spawn.lng,
                        SCAN_ALTITUDE_M,
                    ),
                    appears_at: Some(scan_abs.max(0.0) as u64),
                    leaves_at: Some(leaves_abs.max(0.0) as u64),
                };
                (scan_abs, target)
            })
            .collect();

        targets.sort_by(|a, b| a.0.total_cmp(&b.0));
        queue.extend(targets.into_iter().map(|(_, t)| t))
    }

    fn location_changed(&mut self, _location: Location) {
        // Same survey, new cycle; the cached lane assignment stays valid
        // because it only depends on the spawn geometry.
    }
}
