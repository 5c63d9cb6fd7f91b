//! Hexagonal scan-step generation.
//!
//! Produces the ordered lattice of scan locations for area scanning: a set
//! of concentric hexagonal rings around a center point, walked so that
//! consecutive steps are reachable by equal-length hops along hexagon edges.
//!
//! The generator is a pure function of its inputs. For `ring_count` rings it
//! always yields exactly `3 * ring_count * (ring_count - 1) + 1` locations
//! (the centered hexagonal numbers), the first of which is the center itself.
//!
//! # Example
//!
//! ```
//! use fieldscan::geo::Location;
//! use fieldscan::steps::generate;
//!
//! let steps = generate(&Location::new(40.0, -75.0), 2, 0.07);
//! assert_eq!(steps.len(), 7);
//! assert_eq!(steps[0].lat, 40.0);
//! ```

use crate::geo::{self, Location};
use crate::spawns::SpawnPoint;

const NORTH: f64 = 0.0;
const EAST: f64 = 90.0;
const SOUTH: f64 = 180.0;
const WEST: f64 = 270.0;

/// Number of lattice points for a given ring count.
///
/// Centered hexagonal number: ring 0 is the center, ring k adds `6k` points.
pub fn point_count(ring_count: u32) -> usize {
    let r = ring_count as usize;
    3 * r * (r.saturating_sub(1)) + 1
}

/// Generates the hex-lattice scan steps around `center`.
///
/// `step_distance_km` is the distance between a point and each of its six
/// neighbours. Column centers are `sqrt(3) * d` apart, row centers `1.5 * d`,
/// which tiles the plane with the scan discs of radius `d`.
///
/// The walk covers the upper half of the lattice ring by ring, then sweeps
/// back down through the lower half, so consecutive steps stay adjacent.
/// `ring_count == 1` yields only the center.
pub fn generate(center: &Location, ring_count: u32, step_distance_km: f64) -> Vec<Location> {
    let xdist = 3.0_f64.sqrt() * step_distance_km;
    let ydist = 1.5 * step_distance_km;

    let mut results = Vec::with_capacity(point_count(ring_count));
    results.push(*center);

    if ring_count <= 1 {
        return results;
    }

    let mut loc = *center;

    // Upper half: spiral outward one ring at a time.
    let mut ring: u32 = 1;
    while ring < ring_count {
        let odd = ring % 2 == 1;

        loc = geo::offset(&loc, xdist, if odd { WEST } else { EAST });
        results.push(loc);

        for _ in 0..ring {
            loc = geo::offset(&loc, ydist, NORTH);
            loc = geo::offset(&loc, xdist / 2.0, if odd { EAST } else { WEST });
            results.push(loc);
        }

        for _ in 0..ring {
            loc = geo::offset(&loc, xdist, if odd { EAST } else { WEST });
            results.push(loc);
        }

        for _ in 0..ring {
            loc = geo::offset(&loc, ydist, SOUTH);
            loc = geo::offset(&loc, xdist / 2.0, if odd { EAST } else { WEST });
            results.push(loc);
        }

        ring += 1;
    }

    // Lower half: sweep back towards the southern tip.
    let mut ring = ring_count - 1;
    let odd = ring % 2 == 1;

    loc = geo::offset(&loc, ydist, SOUTH);
    loc = geo::offset(&loc, xdist / 2.0, if odd { WEST } else { EAST });
    results.push(loc);

    while ring > 0 {
        let odd = ring % 2 == 1;

        if ring == 1 {
            loc = geo::offset(&loc, xdist, WEST);
            results.push(loc);
        } else {
            for _ in 0..ring - 1 {
                loc = geo::offset(&loc, ydist, SOUTH);
                loc = geo::offset(&loc, xdist / 2.0, if odd { WEST } else { EAST });
                results.push(loc);
            }

            for _ in 0..ring {
                loc = geo::offset(&loc, xdist, if odd { WEST } else { EAST });
                results.push(loc);
            }

            for _ in 0..ring - 1 {
                loc = geo::offset(&loc, ydist, NORTH);
                loc = geo::offset(&loc, xdist / 2.0, if odd { WEST } else { EAST });
                results.push(loc);
            }

            loc = geo::offset(&loc, xdist, if odd { EAST } else { WEST });
            results.push(loc);
        }

        ring -= 1;
    }

    results
}

/// Rotates the final steps of the walk to the front of the sequence.
///
/// The generation order finishes near the center, so pulling those last
/// steps forward scans the densest area first instead of covering the whole
/// northern half before anything close to the center. Pure list rotation;
/// the set of steps is unchanged.
pub fn front_load_center(steps: &mut Vec<Location>, ring_count: u32) {
    if ring_count < 3 {
        return;
    }
    let take = if ring_count == 3 { 2 } else { 7 };
    if steps.len() <= take {
        return;
    }
    let tail: Vec<Location> = steps.split_off(steps.len() - take);
    steps.splice(0..0, tail);
}

/// Bounding box of the lattice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HexBounds {
    /// Northernmost latitude.
    pub north: f64,
    /// Easternmost longitude.
    pub east: f64,
    /// Southernmost latitude.
    pub south: f64,
    /// Westernmost longitude.
    pub west: f64,
}

/// Computes a conservative bounding box around the hex lattice.
///
/// Over-covers on purpose (hexes are not square); callers use it to bound
/// which known spawn points could possibly fall inside the scan area.
pub fn hex_bounds(center: &Location, ring_count: u32, step_distance_km: f64) -> HexBounds {
    let reach = step_distance_km * 2.0 * ring_count as f64;
    HexBounds {
        north: geo::offset(center, reach, NORTH).lat,
        east: geo::offset(center, reach, EAST).lng,
        south: geo::offset(center, reach, SOUTH).lat,
        west: geo::offset(center, reach, WEST).lng,
    }
}

/// Drops lattice steps that have no known spawn point within `within_metres`.
///
/// Used by the spawnpoints-only hex mode: steps over dead ground are not
/// worth a scan slot.
pub fn filter_by_spawn_proximity(
    steps: Vec<Location>,
    spawn_points: &[SpawnPoint],
    within_metres: f64,
) -> Vec<Location> {
    steps
        .into_iter()
        .filter(|step| {
            spawn_points.iter().any(|sp| {
                geo::equirect_distance(step, &sp.location()) * 1000.0 <= within_metres
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::haversine_distance;

    #[test]
    fn test_single_ring_is_center_only() {
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 1, 0.07);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0], center);
    }

    #[test]
    fn test_two_rings_yield_seven_points() {
        // 3 * 2 * 1 + 1 = 7
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 2, 0.07);
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0], center);
    }

    #[test]
    fn test_point_count_formula() {
        assert_eq!(point_count(1), 1);
        assert_eq!(point_count(2), 7);
        assert_eq!(point_count(3), 19);
        assert_eq!(point_count(4), 37);
        assert_eq!(point_count(5), 61);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let center = Location::new(37.5308, -122.2881);
        let a = generate(&center, 4, 0.07);
        let b = generate(&center, 4, 0.07);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ring_one_points_surround_center() {
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 2, 0.07);

        // Every non-center point sits within one column spacing of the center.
        let xdist = 3.0_f64.sqrt() * 0.07;
        for step in &steps[1..] {
            let d = haversine_distance(&center, step);
            assert!(d > 0.0, "duplicate of center");
            assert!(d <= xdist + 1e-6, "ring-1 point {}km out", d);
        }
    }

    #[test]
    fn test_consecutive_steps_are_adjacent() {
        // Consecutive steps must never jump farther than one column spacing;
        // that is what makes the walk physically traversable.
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 5, 0.07);
        let max_hop = 3.0_f64.sqrt() * 0.07 + 1e-6;

        for pair in steps.windows(2) {
            let d = haversine_distance(&pair[0], &pair[1]);
            assert!(d <= max_hop, "hop of {}km exceeds {}km", d, max_hop);
        }
    }

    #[test]
    fn test_front_load_center_rotates() {
        let center = Location::new(40.0, -75.0);
        let original = generate(&center, 3, 0.07);
        let mut rotated = original.clone();
        front_load_center(&mut rotated, 3);

        assert_eq!(rotated.len(), original.len());
        assert_eq!(rotated[0], original[original.len() - 2]);
        assert_eq!(rotated[1], original[original.len() - 1]);
        assert_eq!(rotated[2], original[0]);
    }

    #[test]
    fn test_front_load_center_noop_below_three_rings() {
        let center = Location::new(40.0, -75.0);
        let original = generate(&center, 2, 0.07);
        let mut rotated = original.clone();
        front_load_center(&mut rotated, 2);
        assert_eq!(rotated, original);
    }

    #[test]
    fn test_hex_bounds_ordering() {
        let center = Location::new(40.0, -75.0);
        let bounds = hex_bounds(&center, 3, 0.07);
        assert!(bounds.north > center.lat);
        assert!(bounds.south < center.lat);
        assert!(bounds.east > center.lng);
        assert!(bounds.west < center.lng);
    }

    #[test]
    fn test_filter_by_spawn_proximity() {
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 2, 0.07);

        // One spawn point sitting on the center: only the center step (and
        // anything within 70m of it) survives.
        let spawns = vec![SpawnPoint {
            id: "abc".into(),
            lat: 40.0,
            lng: -75.0,
            time_of_hour: 100,
        }];
        let filtered = filter_by_spawn_proximity(steps, &spawns, 70.0);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0], center);
    }

    #[test]
    fn test_filter_with_no_spawns_drops_everything() {
        let center = Location::new(40.0, -75.0);
        let steps = generate(&center, 3, 0.07);
        let filtered = filter_by_spawn_proximity(steps, &[], 70.0);
        assert!(filtered.is_empty());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_count_matches_formula(
                lat in -60.0..60.0_f64,
                lng in -170.0..170.0_f64,
                rings in 1u32..8,
                dist in 0.01..0.9_f64
            ) {
                let steps = generate(&Location::new(lat, lng), rings, dist);
                prop_assert_eq!(steps.len(), point_count(rings));
            }

            #[test]
            fn test_first_point_is_center(
                lat in -60.0..60.0_f64,
                lng in -170.0..170.0_f64,
                rings in 1u32..8
            ) {
                let center = Location::new(lat, lng);
                let steps = generate(&center, rings, 0.07);
                prop_assert_eq!(steps[0], center);
            }

            #[test]
            fn test_front_load_preserves_set(
                rings in 3u32..7
            ) {
                let center = Location::new(40.0, -75.0);
                let original = generate(&center, rings, 0.07);
                let mut rotated = original.clone();
                front_load_center(&mut rotated, rings);

                prop_assert_eq!(rotated.len(), original.len());
                for p in &original {
                    prop_assert!(rotated.contains(p));
                }
            }
        }
    }
}
