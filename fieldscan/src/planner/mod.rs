//! Speed-limited spawn assignment.
//!
//! Packs time-windowed spawn points onto a fixed number of worker lanes so
//! that no worker ever has to travel faster than the configured maximum
//! speed between consecutive scans. Greedy, time-ordered: each point is
//! probed against every feasible insertion position in every lane with a
//! dry-run cost computation, and the cheapest position wins.
//!
//! A point that cannot be placed anywhere without incurring more than the
//! maximum acceptable delay is rejected into an "unassignable" list rather
//! than forced in — the caller decides whether to drop or alert.
//!
//! All arithmetic happens in "seconds past the hour" space with gaps taken
//! modulo 3600: a lane's schedule is circular, repeating every hour. The
//! assignment is computed once per spawn-set load and cached; only the
//! projection onto absolute timestamps is refreshed each cycle, because the
//! relative geometry and ordering never change.

use tracing::{debug, info};

use crate::geo;
use crate::spawns::SpawnPoint;

/// Grace period added to each spawn's appearance before scanning, seconds.
///
/// Data for a fresh event is not reliably available at the exact appearance
/// second.
pub const GRACE_SECS: f64 = 10.0;

/// Default maximum worker travel speed in km/h.
pub const DEFAULT_MAX_SPEED_KMPH: f64 = 35.0;

/// Default pacing delay between scans on one lane, seconds.
pub const DEFAULT_SCAN_DELAY_SECS: f64 = 10.0;

/// Default maximum acceptable scheduling delay for one point, seconds.
pub const DEFAULT_MAX_DELAY_SECS: f64 = 600.0;

/// Planner parameters.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Number of worker lanes to pack.
    pub lane_count: usize,

    /// Maximum plausible travel speed between consecutive scans, km/h.
    pub max_speed_kmph: f64,

    /// Minimum spacing between two scans on the same lane, seconds.
    pub scan_delay_secs: f64,

    /// Maximum delay a point may absorb before it is rejected, seconds.
    pub max_delay_secs: f64,
}

impl PlannerConfig {
    /// Creates a config for `lane_count` lanes with default limits.
    pub fn new(lane_count: usize) -> Self {
        Self {
            lane_count,
            max_speed_kmph: DEFAULT_MAX_SPEED_KMPH,
            scan_delay_secs: DEFAULT_SCAN_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One spawn point placed on a lane at a concrete scan time.
#[derive(Clone, Debug)]
pub struct PlannedSpawn {
    /// Lane (worker slot) index the point was assigned to.
    pub lane: usize,

    /// The spawn point itself.
    pub spawn: SpawnPoint,

    /// Scheduled scan time in seconds past the hour. May exceed the spawn's
    /// raw appearance offset when delay was absorbed, and may exceed 3600
    /// when the slot wrapped past the hour boundary.
    pub scan_time_of_hour: f64,
}

/// Result of an assignment run.
#[derive(Clone, Debug, Default)]
pub struct AssignmentOutcome {
    /// Assigned points across all lanes, ascending scan time.
    pub planned: Vec<PlannedSpawn>,

    /// Non-zero delays that were absorbed to make points fit, seconds.
    pub delays: Vec<f64>,

    /// Points that could not be placed under the max-delay bound.
    pub unassignable: Vec<SpawnPoint>,
}

impl AssignmentOutcome {
    /// Mean absorbed delay in seconds, or zero when none were incurred.
    pub fn average_delay(&self) -> f64 {
        if self.delays.is_empty() {
            0.0
        } else {
            self.delays.iter().sum::<f64>() / self.delays.len() as f64
        }
    }

    /// Largest absorbed delay in seconds, or zero when none were incurred.
    pub fn max_delay(&self) -> f64 {
        self.delays.iter().copied().fold(0.0, f64::max)
    }
}

/// A lane entry during packing.
#[derive(Clone, Debug)]
struct Slot {
    spawn: SpawnPoint,
    scan_time: f64,
}

/// Cost of one candidate insertion: `(delay, peak speed, inbound speed,
/// outbound speed)`, compared lexicographically. Infinite delay marks an
/// infeasible position.
#[derive(Clone, Copy, Debug)]
struct Cost {
    delay: f64,
    peak: f64,
    inbound: f64,
    outbound: f64,
}

impl Cost {
    const INFEASIBLE: Cost = Cost {
        delay: f64::INFINITY,
        peak: 0.0,
        inbound: 0.0,
        outbound: 0.0,
    };

    fn feasible(&self) -> bool {
        self.delay.is_finite()
    }

    fn cmp(&self, other: &Cost) -> std::cmp::Ordering {
        self.delay
            .total_cmp(&other.delay)
            .then(self.peak.total_cmp(&other.peak))
            .then(self.inbound.total_cmp(&other.inbound))
            .then(self.outbound.total_cmp(&other.outbound))
    }
}

/// Time gap from `from_time` to `to_time` on the circular hour schedule,
/// never less than the configured scan delay.
fn gap_secs(from_time: f64, to_time: f64, scan_delay: f64) -> f64 {
    ((to_time - from_time).rem_euclid(3600.0)).max(scan_delay)
}

/// Travel speed in km/h required to move between two slots.
fn required_speed(from: &Slot, to: &Slot, scan_delay: f64) -> f64 {
    let time = gap_secs(from.scan_time, to.scan_time, scan_delay);
    if time == 0.0 {
        return f64::INFINITY;
    }
    let distance = geo::haversine_distance(&from.spawn.location(), &to.spawn.location());
    distance / time * 3600.0
}

/// Probe (and optionally perform) the cheapest insertion of `candidate`
/// into `lane`.
///
/// Dry runs return the cost the insertion *would* incur; wet runs insert at
/// the winning position. An empty lane is free to take anything, but its
/// dry-run cost is a third of the maximum delay so a fresh lane only opens
/// when every existing lane would charge more than that.
fn insert(lane: &mut Vec<Slot>, candidate: &Slot, config: &PlannerConfig, dry: bool) -> Cost {
    let max_speed = config.max_speed_kmph;
    let scan_delay = config.scan_delay_secs;

    if lane.is_empty() {
        if dry {
            return Cost {
                delay: config.max_delay_secs / 3.0,
                peak: max_speed,
                inbound: max_speed,
                outbound: max_speed,
            };
        }
        lane.push(candidate.clone());
        return Cost {
            delay: 0.0,
            peak: max_speed,
            inbound: max_speed,
            outbound: max_speed,
        };
    }

    // A position between A and B is worth probing when A's scan happens
    // early enough that the candidate could still fit before max_delay runs
    // out, and B leaves room for a scan slot.
    let mut positions = Vec::new();
    for k in 0..lane.len() {
        if lane[k].scan_time <= candidate.scan_time + config.max_delay_secs - scan_delay
            && (k == lane.len() - 1 || candidate.scan_time + scan_delay <= lane[k + 1].scan_time)
        {
            positions.push(k + 1);
        }
    }

    let mut best: Option<(Cost, usize, Slot)> = None;
    for k in positions {
        let i = k - 1;
        // Insertion at the end wraps around to the lane's first slot: the
        // schedule repeats every hour.
        let j = k % lane.len();

        if i != j && j != 0 && lane[j].scan_time < candidate.scan_time + scan_delay {
            continue;
        }

        // Never scan sooner than scan_delay after the predecessor.
        let mut placed = candidate.clone();
        placed.scan_time = candidate
            .scan_time
            .max(lane[i].scan_time + scan_delay);

        let inbound = required_speed(&lane[i], &placed, scan_delay);
        let outbound = required_speed(&placed, &lane[j], scan_delay);

        let score = if i != j
            && (lane[j].scan_time - lane[i].scan_time).rem_euclid(3600.0) < 2.0 * scan_delay
        {
            // No room between the neighbours for another scan slot.
            Cost::INFEASIBLE
        } else if inbound <= max_speed && outbound <= max_speed {
            Cost {
                delay: 0.0,
                peak: inbound.max(outbound),
                inbound,
                outbound,
            }
        } else if outbound > max_speed {
            Cost::INFEASIBLE
        } else {
            // Inbound leg too fast: wiggle the scan time until the inbound
            // speed equals max_speed exactly, then re-check the outbound leg.
            let distance =
                geo::haversine_distance(&lane[i].spawn.location(), &placed.spawn.location());
            let time_to_wait =
                distance / max_speed * 3600.0 - (placed.scan_time - lane[i].scan_time);

            if time_to_wait
                > (lane[j].scan_time - placed.scan_time - scan_delay).rem_euclid(3600.0)
            {
                Cost::INFEASIBLE
            } else {
                placed.scan_time += time_to_wait;
                let outbound = required_speed(&placed, &lane[j], scan_delay);
                if outbound <= max_speed {
                    Cost {
                        delay: time_to_wait,
                        peak: max_speed.max(outbound),
                        inbound: max_speed,
                        outbound,
                    }
                } else {
                    Cost::INFEASIBLE
                }
            }
        };

        let replace = match &best {
            None => true,
            Some((best_cost, best_k, _)) => match score.cmp(best_cost) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => k < *best_k,
                std::cmp::Ordering::Greater => false,
            },
        };
        if replace {
            best = Some((score, k, placed));
        }
    }

    let Some((score, k, placed)) = best else {
        return Cost::INFEASIBLE;
    };

    if !dry && score.feasible() {
        lane.insert(k, placed);
    }
    score
}

/// Assigns spawn points to lanes.
///
/// Points are processed in ascending scan-time order. Each point lands on
/// the globally cheapest feasible position (ties break to the lowest lane
/// index, then the lowest insertion position); points whose best option
/// exceeds `max_delay_secs` are returned as unassignable.
pub fn assign(spawn_points: &[SpawnPoint], config: &PlannerConfig) -> AssignmentOutcome {
    info!(
        spawns = spawn_points.len(),
        lanes = config.lane_count,
        "Assigning spawn points to worker lanes"
    );

    let mut slots: Vec<Slot> = spawn_points
        .iter()
        .map(|sp| Slot {
            spawn: sp.clone(),
            scan_time: (sp.time_of_hour as f64 + GRACE_SECS) % 3600.0,
        })
        .collect();
    slots.sort_by(|a, b| a.scan_time.total_cmp(&b.scan_time));

    let mut lanes: Vec<Vec<Slot>> = vec![Vec::new(); config.lane_count];
    let mut outcome = AssignmentOutcome::default();

    for slot in slots {
        let mut best: Option<(Cost, usize)> = None;
        for (lane_idx, lane) in lanes.iter_mut().enumerate() {
            let cost = insert(lane, &slot, config, true);
            // Strict less-than: ties keep the lowest lane index.
            if best
                .map_or(true, |(best_cost, _)| cost.cmp(&best_cost).is_lt())
            {
                best = Some((cost, lane_idx));
            }
        }

        let Some((cost, lane_idx)) = best else {
            outcome.unassignable.push(slot.spawn);
            continue;
        };

        if cost.delay <= config.max_delay_secs {
            let incurred = insert(&mut lanes[lane_idx], &slot, config, false);
            if incurred.delay > 0.0 {
                outcome.delays.push(incurred.delay);
            }
        } else {
            debug!(
                id = %slot.spawn.id,
                delay = cost.delay,
                "Spawn point unassignable under max delay"
            );
            outcome.unassignable.push(slot.spawn);
        }
    }

    for (lane_idx, lane) in lanes.into_iter().enumerate() {
        for slot in lane {
            outcome.planned.push(PlannedSpawn {
                lane: lane_idx,
                spawn: slot.spawn,
                scan_time_of_hour: slot.scan_time,
            });
        }
    }
    outcome
        .planned
        .sort_by(|a, b| a.scan_time_of_hour.total_cmp(&b.scan_time_of_hour));

    info!(
        assigned = outcome.planned.len(),
        unassignable = outcome.unassignable.len(),
        delayed = outcome.delays.len(),
        "Completed lane assignment"
    );
    outcome
}
