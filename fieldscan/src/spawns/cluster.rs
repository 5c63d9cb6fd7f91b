//! Spawn-point clustering.
//!
//! Groups spawn points that are close together and appear at similar times
//! into a single merged scan target, cutting redundant visits. Greedy single
//! pass: each point joins the cheapest open cluster that can absorb it
//! without violating the distance radius or the time-window threshold, or
//! opens a new one.
//!
//! The centroid is updated incrementally: adding the (n+1)-th member moves
//! it along the great circle toward the new point with weight `1/(n+1)`,
//! which keeps each insertion O(1) instead of re-averaging all members.

use tracing::debug;

use crate::geo::{self, Location};
use crate::spawns::SpawnPoint;

/// A group of nearby, time-correlated spawn points.
#[derive(Clone, Debug)]
pub struct SpawnCluster {
    members: Vec<SpawnPoint>,
    centroid: Location,
    min_time: u32,
    max_time: u32,
    /// Member whose appearance time defines the cluster's scan moment.
    representative: SpawnPoint,
}

impl SpawnCluster {
    fn new(spawn: SpawnPoint) -> Self {
        Self {
            centroid: spawn.location(),
            min_time: spawn.time_of_hour,
            max_time: spawn.time_of_hour,
            representative: spawn.clone(),
            members: vec![spawn],
        }
    }

    /// The cluster's current centroid.
    pub fn centroid(&self) -> Location {
        self.centroid
    }

    /// Earliest member appearance time, seconds past the hour.
    pub fn min_time(&self) -> u32 {
        self.min_time
    }

    /// Latest member appearance time, seconds past the hour.
    pub fn max_time(&self) -> u32 {
        self.max_time
    }

    /// Number of member spawn points.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if the cluster has no members (never the case once built).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterates the member spawn points.
    pub fn members(&self) -> impl Iterator<Item = &SpawnPoint> {
        self.members.iter()
    }

    /// Centroid the cluster would have after absorbing `spawn`.
    fn simulate_centroid(&self, spawn: &SpawnPoint) -> Location {
        let n = self.members.len() as f64;
        // Fraction n/(n+1) of the way from the new point to the current
        // centroid == weight 1/(n+1) for the new point.
        geo::intermediate_point(&spawn.location(), &self.centroid, n / (n + 1.0))
    }

    fn absorb(&mut self, spawn: SpawnPoint) {
        self.centroid = self.simulate_centroid(&spawn);

        if spawn.time_of_hour < self.min_time {
            self.min_time = spawn.time_of_hour;
        } else if spawn.time_of_hour > self.max_time {
            // The latest member becomes the representative: by the time it
            // appears, every earlier member is already visible.
            self.max_time = spawn.time_of_hour;
            self.representative = spawn.clone();
        }

        self.members.push(spawn);
    }

    /// Produces the single spawn point that stands in for this cluster.
    ///
    /// Located at the centroid, timed at the latest member's appearance, and
    /// carrying that member's id.
    pub fn to_spawn_point(&self) -> SpawnPoint {
        SpawnPoint {
            id: self.representative.id.clone(),
            lat: self.centroid.lat,
            lng: self.centroid.lng,
            time_of_hour: self.max_time,
        }
    }
}

/// Cost of merging `spawn` into `cluster`: centroid distance in metres, or
/// infinity when the merged time span would exceed `time_threshold_secs`.
fn cost(spawn: &SpawnPoint, cluster: &SpawnCluster, time_threshold_secs: u32) -> f64 {
    let min_time = cluster.min_time.min(spawn.time_of_hour);
    let max_time = cluster.max_time.max(spawn.time_of_hour);
    if max_time - min_time > time_threshold_secs {
        return f64::INFINITY;
    }

    geo::equirect_distance(&spawn.location(), &cluster.centroid) * 1000.0
}

/// Whether `cluster` can absorb `spawn` without breaking its invariants.
fn can_absorb(
    spawn: &SpawnPoint,
    cluster: &SpawnCluster,
    radius_metres: f64,
    time_threshold_secs: u32,
) -> bool {
    if cost(spawn, cluster, time_threshold_secs) > 2.0 * radius_metres {
        return false;
    }

    let new_centroid = cluster.simulate_centroid(spawn);

    if geo::equirect_distance(&spawn.location(), &new_centroid) * 1000.0 > radius_metres {
        return false;
    }

    // Every existing member must stay inside the radius after the centroid
    // shifts toward the new point.
    !cluster.members().any(|member| {
        geo::equirect_distance(&member.location(), &new_centroid) * 1000.0 > radius_metres
    })
}

/// Greedy single-pass clustering.
///
/// For each point, the open cluster with the lowest merge cost is tried
/// first (ties keep the earliest-created cluster); if it cannot absorb the
/// point a new cluster opens. O(points × clusters), which stays cheap
/// because clusters are spatially local.
pub fn cluster(
    spawn_points: &[SpawnPoint],
    radius_metres: f64,
    time_threshold_secs: u32,
) -> Vec<SpawnCluster> {
    let mut clusters: Vec<SpawnCluster> = Vec::new();

    for spawn in spawn_points {
        // Strict less-than keeps the first-created cluster on cost ties.
        let mut best: Option<(f64, usize)> = None;
        for (idx, c) in clusters.iter().enumerate() {
            let c_cost = cost(spawn, c, time_threshold_secs);
            if best.map_or(true, |(best_cost, _)| c_cost < best_cost) {
                best = Some((c_cost, idx));
            }
        }

        match best {
            Some((_, idx))
                if can_absorb(spawn, &clusters[idx], radius_metres, time_threshold_secs) =>
            {
                clusters[idx].absorb(spawn.clone());
            }
            _ => clusters.push(SpawnCluster::new(spawn.clone())),
        }
    }

    if cfg!(debug_assertions) {
        for c in &clusters {
            debug_assert!(c.max_time - c.min_time <= time_threshold_secs);
            debug_assert!(c.members().all(|m| {
                geo::equirect_distance(&m.location(), &c.centroid) * 1000.0 <= radius_metres
            }));
        }
    }

    clusters
}

/// Clusters spawn points and returns one representative spawn per cluster.
///
/// This is the entry point the scheduling strategies use: the output slots
/// straight back into the pipeline anywhere a plain spawn list would.
pub fn cluster_spawn_points(
    spawn_points: &[SpawnPoint],
    radius_metres: f64,
    time_threshold_secs: u32,
) -> Vec<SpawnPoint> {
    let clusters = cluster(spawn_points, radius_metres, time_threshold_secs);

    debug!(
        input = spawn_points.len(),
        clusters = clusters.len(),
        "Clustered spawn points"
    );

    clusters.iter().map(SpawnCluster::to_spawn_point).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset;

    fn spawn_at(id: &str, location: Location, time: u32) -> SpawnPoint {
        SpawnPoint {
            id: id.to_string(),
            lat: location.lat,
            lng: location.lng,
            time_of_hour: time,
        }
    }

    fn base() -> Location {
        Location::new(37.5308, -122.2881)
    }

    #[test]
    fn test_two_close_points_with_close_times_merge() {
        // 10m apart, 60s apart in time: one cluster.
        let a = spawn_at("a", base(), 100);
        let b = spawn_at("b", offset(&base(), 0.010, 90.0), 160);

        let clusters = cluster(&[a, b], 70.0, 240);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn test_time_gap_splits_clusters() {
        // 10m apart but 300s apart in time with a 240s threshold: two
        // clusters (merge cost is infinite).
        let a = spawn_at("a", base(), 100);
        let b = spawn_at("b", offset(&base(), 0.010, 90.0), 400);

        let clusters = cluster(&[a, b], 70.0, 240);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_distant_points_stay_separate() {
        let a = spawn_at("a", base(), 100);
        let b = spawn_at("b", offset(&base(), 0.500, 90.0), 100);

        let clusters = cluster(&[a, b], 70.0, 240);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_representative_takes_latest_time() {
        let a = spawn_at("early", base(), 100);
        let b = spawn_at("late", offset(&base(), 0.010, 90.0), 200);

        let reps = cluster_spawn_points(&[a, b], 70.0, 240);
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].id, "late");
        assert_eq!(reps[0].time_of_hour, 200);
    }

    #[test]
    fn test_centroid_moves_toward_new_member() {
        let a = spawn_at("a", base(), 100);
        let b_loc = offset(&base(), 0.020, 90.0);
        let b = spawn_at("b", b_loc, 100);

        let clusters = cluster(&[a, b], 70.0, 240);
        assert_eq!(clusters.len(), 1);

        let centroid = clusters[0].centroid();
        let to_a = geo::equirect_distance(&centroid, &base()) * 1000.0;
        let to_b = geo::equirect_distance(&centroid, &b_loc) * 1000.0;
        // Two members: centroid sits halfway.
        assert!((to_a - to_b).abs() < 1.0, "centroid skewed: {} vs {}", to_a, to_b);
    }

    #[test]
    fn test_single_point_cluster() {
        let a = spawn_at("solo", base(), 500);
        let clusters = cluster(std::slice::from_ref(&a), 70.0, 240);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 1);
        assert_eq!(clusters[0].to_spawn_point().id, "solo");
    }

    #[test]
    fn test_empty_input() {
        let clusters = cluster(&[], 70.0, 240);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_tie_breaks_to_first_created() {
        // Two clusters at equal distance from a third point; the earlier
        // cluster wins the merge.
        let left = spawn_at("left", offset(&base(), 0.030, 270.0), 100);
        let right = spawn_at("right", offset(&base(), 0.030, 90.0), 100);
        let middle = spawn_at("middle", base(), 100);

        let clusters = cluster(&[left, right, middle], 70.0, 240);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2, "middle should join the first cluster");
        assert_eq!(clusters[1].len(), 1);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_spawns() -> impl Strategy<Value = Vec<SpawnPoint>> {
            prop::collection::vec(
                (0.0..0.3_f64, 0.0..360.0_f64, 0u32..3600),
                0..40,
            )
            .prop_map(|points| {
                points
                    .into_iter()
                    .enumerate()
                    .map(|(i, (dist, bearing, time))| {
                        let loc = offset(&Location::new(37.53, -122.28), dist, bearing);
                        SpawnPoint {
                            id: format!("sp-{}", i),
                            lat: loc.lat,
                            lng: loc.lng,
                            time_of_hour: time,
                        }
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn test_cluster_invariants(spawns in arb_spawns()) {
                let radius = 70.0;
                let threshold = 240;
                let clusters = cluster(&spawns, radius, threshold);

                // Every input point lands in exactly one cluster.
                let total: usize = clusters.iter().map(|c| c.len()).sum();
                prop_assert_eq!(total, spawns.len());

                for c in &clusters {
                    prop_assert!(c.max_time() - c.min_time() <= threshold);
                    for member in c.members() {
                        let d = geo::equirect_distance(
                            &member.location(),
                            &c.centroid(),
                        ) * 1000.0;
                        prop_assert!(
                            d <= radius,
                            "member {}m from centroid (radius {})",
                            d,
                            radius
                        );
                        prop_assert!(member.time_of_hour >= c.min_time());
                        prop_assert!(member.time_of_hour <= c.max_time());
                    }
                }
            }
        }
    }
}
