//! Scan configuration.
//!
//! All tunables for a scanning instance, grouped by concern with defaults
//! matching long-standing field practice. Builders mutate in place and
//! return `self`, so call sites read as a single chained expression.

use std::path::PathBuf;

use crate::geo::Location;
use crate::planner::PlannerConfig;
use crate::rpc::ProxyRotation;

/// Default number of concurrent scan workers.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default name of the account set workers claim from.
pub const DEFAULT_ACCOUNT_SET: &str = "default";

/// Default hex lattice ring count.
pub const DEFAULT_RING_COUNT: u32 = 5;

/// Default hex step distance in kilometres (event visibility radius).
pub const DEFAULT_STEP_DISTANCE_KM: f64 = 0.070;

/// Step distance when only wide-radius entities are scanned, km.
pub const WIDE_STEP_DISTANCE_KM: f64 = 0.900;

/// Default pacing delay after each scan attempt, seconds.
pub const DEFAULT_SCAN_DELAY_SECS: u64 = 10;

/// Default maximum plausible worker travel speed, km/h.
pub const DEFAULT_MAX_SPEED_KMPH: f64 = 35.0;

/// Default maximum acceptable scheduling delay, seconds.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 600;

/// Default minimum remaining visibility to bother scanning, seconds.
pub const DEFAULT_MIN_SECONDS_LEFT: u64 = 300;

/// Default consecutive-failure threshold before identity replacement.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default number of login retries after the initial attempt.
pub const DEFAULT_LOGIN_RETRIES: u32 = 3;

/// Default delay between login attempts, seconds.
pub const DEFAULT_LOGIN_DELAY_SECS: u64 = 5;

/// Default scan-position jitter bound, metres.
pub const DEFAULT_JITTER_METRES: f64 = 10.0;

/// Default cluster radius, metres.
pub const DEFAULT_CLUSTER_RADIUS_M: f64 = 70.0;

/// Default cluster time-window threshold, seconds.
pub const DEFAULT_CLUSTER_TIME_THRESHOLD_SECS: u32 = 240;

/// Default number of webhook delivery workers.
pub const DEFAULT_DELIVERY_WORKERS: usize = 4;

/// Delivery queue depth that triggers a backpressure warning.
pub const DEFAULT_QUEUE_WARNING_DEPTH: usize = 50;

/// Default interval between status snapshots pushed to persistence, secs.
pub const DEFAULT_STATUS_SNAPSHOT_SECS: u64 = 3;

/// Which target-generation strategy the overseer runs.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Static concentric hex lattice around the center.
    #[default]
    HexGrid,

    /// Hex lattice, but only steps near known spawn points.
    HexGridSpawnpointsOnly,

    /// Known spawn points in appearance order.
    SpawnTimed,

    /// Spawn points packed onto worker lanes under the speed limit.
    SpawnTimedSpeedLimited,
}

impl ScanMode {
    /// Human-readable method name for status display.
    pub fn method_name(&self) -> &'static str {
        match self {
            ScanMode::HexGrid => "Hex Grid",
            ScanMode::HexGridSpawnpointsOnly => "Hex Grid (spawnpoints only)",
            ScanMode::SpawnTimed => "Spawn Point",
            ScanMode::SpawnTimedSpeedLimited => "Spawn Point (speed limited)",
        }
    }

    /// Whether this mode needs the spawn-point survey file.
    pub fn needs_spawn_data(&self) -> bool {
        !matches!(self, ScanMode::HexGrid)
    }
}

/// Hex lattice parameters.
#[derive(Clone, Debug)]
pub struct HexGridConfig {
    /// Number of concentric rings (1 = center only).
    pub ring_count: u32,
    /// Distance between adjacent lattice points, km.
    pub step_distance_km: f64,
    /// Radius around a step within which a spawn point counts as covered,
    /// metres. Used by the spawnpoints-only mode.
    pub spawn_proximity_m: f64,
}

impl Default for HexGridConfig {
    fn default() -> Self {
        Self {
            ring_count: DEFAULT_RING_COUNT,
            step_distance_km: DEFAULT_STEP_DISTANCE_KM,
            spawn_proximity_m: DEFAULT_CLUSTER_RADIUS_M,
        }
    }
}

/// Spawn-point input and clustering parameters.
#[derive(Clone, Debug)]
pub struct SpawnConfig {
    /// JSON survey file with known spawn points. Required by every mode
    /// except the plain hex grid.
    pub file: Option<PathBuf>,
    /// Merge nearby, time-correlated spawns before scheduling.
    pub cluster: bool,
    /// Cluster distance radius, metres.
    pub cluster_radius_m: f64,
    /// Cluster time-window threshold, seconds.
    pub cluster_time_threshold_secs: u32,
    /// On the first fill after startup, pause, or relocation, include
    /// events whose window already started.
    pub scan_current: bool,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            file: None,
            cluster: false,
            cluster_radius_m: DEFAULT_CLUSTER_RADIUS_M,
            cluster_time_threshold_secs: DEFAULT_CLUSTER_TIME_THRESHOLD_SECS,
            scan_current: true,
        }
    }
}

/// Pacing and physical-plausibility limits.
#[derive(Clone, Debug)]
pub struct PacingConfig {
    /// Unconditional delay after each scan attempt, seconds.
    pub scan_delay_secs: u64,
    /// Maximum plausible travel speed, km/h. Drives account cooldowns and
    /// the lane planner.
    pub max_speed_kmph: f64,
    /// Maximum scheduling delay before a spawn point is dropped, seconds.
    pub max_delay_secs: u64,
    /// Skip targets with less than this much visibility left, seconds.
    pub min_seconds_left: u64,
    /// Random jitter applied to each scan position, metres. `None` scans
    /// the exact coordinates.
    pub jitter_metres: Option<f64>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            scan_delay_secs: DEFAULT_SCAN_DELAY_SECS,
            max_speed_kmph: DEFAULT_MAX_SPEED_KMPH,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            min_seconds_left: DEFAULT_MIN_SECONDS_LEFT,
            jitter_metres: Some(DEFAULT_JITTER_METRES),
        }
    }
}

/// Login behavior.
#[derive(Clone, Debug)]
pub struct LoginConfig {
    /// Retries after the initial authentication attempt.
    pub retries: u32,
    /// Delay between attempts, seconds.
    pub delay_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_LOGIN_RETRIES,
            delay_secs: DEFAULT_LOGIN_DELAY_SECS,
        }
    }
}

/// Output fan-out parameters.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Number of webhook delivery workers.
    pub delivery_workers: usize,
    /// Delivery queue depth that triggers a logged warning.
    pub queue_warning_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delivery_workers: DEFAULT_DELIVERY_WORKERS,
            queue_warning_depth: DEFAULT_QUEUE_WARNING_DEPTH,
        }
    }
}

/// Top-level configuration for one scanning instance.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Target-generation strategy.
    pub mode: ScanMode,
    /// Initial scan center. `None` waits for a location via the service.
    pub center: Option<Location>,
    /// Number of concurrent scan workers.
    pub worker_count: usize,
    /// Account set workers claim identities from.
    pub account_set: String,
    /// Consecutive failures before a worker swaps identities.
    pub max_failures: u32,
    /// Hex lattice parameters.
    pub hex: HexGridConfig,
    /// Spawn input and clustering parameters.
    pub spawns: SpawnConfig,
    /// Pacing and plausibility limits.
    pub pacing: PacingConfig,
    /// Login behavior.
    pub login: LoginConfig,
    /// Output fan-out parameters.
    pub dispatch: DispatchConfig,
    /// Proxy rotation policy across identity acquisitions.
    pub proxy_rotation: ProxyRotation,
    /// Instance name under which status snapshots are persisted. `None`
    /// disables the snapshot task.
    pub instance_name: Option<String>,
    /// Seconds between persisted status snapshots.
    pub status_snapshot_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::default(),
            center: None,
            worker_count: DEFAULT_WORKER_COUNT,
            account_set: DEFAULT_ACCOUNT_SET.to_string(),
            max_failures: DEFAULT_MAX_FAILURES,
            hex: HexGridConfig::default(),
            spawns: SpawnConfig::default(),
            pacing: PacingConfig::default(),
            login: LoginConfig::default(),
            dispatch: DispatchConfig::default(),
            proxy_rotation: ProxyRotation::default(),
            instance_name: None,
            status_snapshot_secs: DEFAULT_STATUS_SNAPSHOT_SECS,
        }
    }
}

impl ScanConfig {
    /// Creates a config for the given mode with defaults everywhere else.
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Sets the initial scan center.
    pub fn with_center(mut self, center: Location) -> Self {
        self.center = Some(center);
        self
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the spawn survey file.
    pub fn with_spawn_file(mut self, path: PathBuf) -> Self {
        self.spawns.file = Some(path);
        self
    }

    /// Enables spawn clustering.
    pub fn with_clustering(mut self) -> Self {
        self.spawns.cluster = true;
        self
    }

    /// Sets the instance name for persisted status snapshots.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Derives the lane planner configuration.
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            lane_count: self.worker_count,
            max_speed_kmph: self.pacing.max_speed_kmph,
            scan_delay_secs: self.pacing.scan_delay_secs as f64,
            max_delay_secs: self.pacing.max_delay_secs as f64,
        }
    }
}
