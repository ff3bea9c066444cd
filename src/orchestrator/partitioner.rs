//! Splitting a work queue into lanes.
//!
//! | Function | Strategy | Used when |
//! |----------|----------|-----------|
//! | [`by_count`] | Round-robin in arrival order | No duration statistics |
//! | [`by_duration`] | Multiway number partitioning over expected durations | Statistics available |
//!
//! [`smart_partition`] picks the partitioning heuristic: greedy (longest
//! first onto the lightest lane) for ordinary sizes, Karmarkar-Karp
//! differencing once the input is large relative to the lane count.
//!
//! # Example
//!
//! ```
//! use splitrun::orchestrator::partitioner::smart_partition;
//!
//! let lanes = smart_partition(&[10, 10, 10, 10], 2).unwrap();
//! assert_eq!(lanes.len(), 2);
//! assert!(lanes.iter().all(|lane| lane.len() == 2));
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::mem;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::unit::BoxedUnit;

/// Inputs above this size are rejected outright.
pub const MAX_UNITS: usize = 4_096_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("partitioning {0} units would take too much time and memory to be useful")]
    TooManyUnits(usize),
}

/// Spread of the expected durations that went into a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationStats {
    pub min: u64,
    pub median: u64,
    pub max: u64,
}

/// Units split into lanes.
#[derive(Debug, Default)]
pub struct Partition {
    pub lanes: Vec<Vec<BoxedUnit>>,
    /// Largest expected lane sum in seconds; 0 when durations are unknown.
    pub max_run_duration: u64,
    pub stats: Option<DurationStats>,
}

/// Number of lanes worth opening for `units` units.
pub fn lane_count(process_count: usize, units: usize) -> usize {
    process_count.min(units)
}

/// Round-robins `units` into `k` lanes, keeping arrival order within each lane.
pub fn by_count(units: Vec<BoxedUnit>, k: usize) -> Partition {
    debug!("Partitioning {} units by count", units.len());
    if k == 0 {
        return Partition::default();
    }

    let mut lanes: Vec<Vec<BoxedUnit>> = (0..k).map(|_| Vec::new()).collect();
    for (i, unit) in units.into_iter().enumerate() {
        lanes[i % k].push(unit);
    }

    Partition {
        lanes,
        max_run_duration: 0,
        stats: None,
    }
}

/// Balances `units` over `k` lanes by expected duration.
///
/// Units without an estimate get the median of the known ones (1 second when
/// none is known) before partitioning.
pub fn by_duration(mut units: Vec<BoxedUnit>, k: usize) -> Result<Partition, PartitionError> {
    debug!("Partitioning {} units by expected duration", units.len());
    if k == 0 || units.is_empty() {
        return Ok(Partition::default());
    }

    let mut known: Vec<u64> = units.iter().filter_map(|u| u.expected_duration()).collect();
    known.sort_unstable();
    let fill = known.get(known.len() / 2).copied().unwrap_or(1);
    for unit in units.iter_mut().filter(|u| u.expected_duration().is_none()) {
        unit.set_expected_duration(fill);
    }

    let durations: Vec<u64> = units.iter().map(|u| u.expected_duration().unwrap_or(fill)).collect();
    let stats = duration_stats(&durations);
    let buckets = smart_partition(&durations, k)?;

    let mut slots: Vec<Option<BoxedUnit>> = units.into_iter().map(Some).collect();
    let mut lanes = Vec::with_capacity(buckets.len());
    let mut max_run_duration = 0;
    for bucket in buckets {
        let sum: u64 = bucket.iter().map(|&i| durations[i]).sum();
        debug!("Expected lane duration: {}s ({} units)", sum, bucket.len());
        max_run_duration = max_run_duration.max(sum);
        lanes.push(bucket.into_iter().filter_map(|i| slots[i].take()).collect::<Vec<_>>());
    }
    debug!("Max run duration: {}s", max_run_duration);

    if let Some(unit) = long_unit(&lanes) {
        warn!(
            "{} takes {} seconds and a whole process to run. The run duration is determined by this unit.",
            unit.id(),
            unit.expected_duration().unwrap_or(0)
        );
    }

    Ok(Partition {
        lanes,
        max_run_duration,
        stats: Some(stats),
    })
}

fn duration_stats(durations: &[u64]) -> DurationStats {
    let mut sorted = durations.to_vec();
    sorted.sort_unstable();
    DurationStats {
        min: sorted.first().copied().unwrap_or(0),
        median: sorted.get(sorted.len() / 2).copied().unwrap_or(0),
        max: sorted.last().copied().unwrap_or(0),
    }
}

/// Unit that sits alone in its lane and is the longest unit of the run.
///
/// Such a unit decides the run's wall-clock time. `None` when every lane
/// holds exactly one unit.
fn long_unit(lanes: &[Vec<BoxedUnit>]) -> Option<&BoxedUnit> {
    if lanes.iter().all(|lane| lane.len() == 1) {
        return None;
    }
    let longest = lanes
        .iter()
        .filter(|lane| lane.len() == 1)
        .map(|lane| &lane[0])
        .max_by_key(|unit| unit.expected_duration())?;

    let overall = lanes
        .iter()
        .flatten()
        .filter_map(|unit| unit.expected_duration())
        .max()
        .unwrap_or(0);
    (longest.expected_duration().unwrap_or(0) >= overall).then_some(longest)
}

/// Splits indices of `durations` into `k` buckets with close sums.
pub fn smart_partition(durations: &[u64], k: usize) -> Result<Vec<Vec<usize>>, PartitionError> {
    let len = durations.len();
    if len > MAX_UNITS {
        return Err(PartitionError::TooManyUnits(len));
    }

    let threshold = k as i64 * 18_000 - 256_000;
    if threshold > 0 && len as i64 >= threshold {
        return karmarkar_karp(durations, k);
    }
    Ok(greedy(durations, k))
}

/// Longest duration first, each onto the lane with the smallest sum.
pub fn greedy(durations: &[u64], k: usize) -> Vec<Vec<usize>> {
    trace!("Partitioning {} durations greedily", durations.len());
    if k == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..durations.len()).collect();
    order.sort_by_key(|&i| Reverse(durations[i]));

    let mut lanes: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..k).map(|lane| Reverse((0, lane))).collect();
    for i in order {
        let Some(Reverse((sum, lane))) = heap.pop() else {
            break;
        };
        lanes[lane].push(i);
        heap.push(Reverse((sum + durations[i], lane)));
    }
    lanes
}

/// K-way Karmarkar-Karp differencing.
///
/// Every duration starts as a one-element tuple. The two tuples with the
/// largest spread are repeatedly merged slot by slot, largest against
/// smallest, until one tuple of at most `k` buckets is left.
pub fn karmarkar_karp(durations: &[u64], k: usize) -> Result<Vec<Vec<usize>>, PartitionError> {
    trace!("Partitioning {} durations with Karmarkar-Karp", durations.len());
    if durations.len() > MAX_UNITS {
        return Err(PartitionError::TooManyUnits(durations.len()));
    }
    if k == 0 {
        return Ok(Vec::new());
    }

    // bucket id == index of its first duration
    let mut buckets: Vec<Vec<usize>> = (0..durations.len()).map(|i| vec![i]).collect();
    let mut sums: Vec<u64> = durations.to_vec();

    let mut seq = 0usize;
    let mut heap: BinaryHeap<(u64, Reverse<usize>, Vec<usize>)> = BinaryHeap::new();
    let mut order: Vec<usize> = (0..durations.len()).collect();
    order.sort_by_key(|&i| Reverse(durations[i]));
    for i in order {
        heap.push((durations[i], Reverse(seq), vec![i]));
        seq += 1;
    }

    while heap.len() > 1 {
        let (Some((_, _, a)), Some((_, _, b))) = (heap.pop(), heap.pop()) else {
            break;
        };

        let mut merged = Vec::with_capacity(k);
        for i in 0..k {
            match (a.get(i).copied(), b.get(k - 1 - i).copied()) {
                (None, None) => {}
                (Some(id), None) | (None, Some(id)) => merged.push(id),
                (Some(ai), Some(bj)) => {
                    let moved = mem::take(&mut buckets[bj]);
                    buckets[ai].extend(moved);
                    sums[ai] += sums[bj];
                    merged.push(ai);
                }
            }
        }
        merged.sort_by_key(|&id| Reverse(sums[id]));

        let spread = match (merged.first(), merged.get(k - 1)) {
            (Some(&hi), Some(&lo)) => sums[hi] - sums[lo],
            (Some(&hi), None) => sums[hi],
            _ => 0,
        };
        heap.push((spread, Reverse(seq), merged));
        seq += 1;
    }

    let mut lanes: Vec<Vec<usize>> = heap
        .pop()
        .map(|(_, _, last)| last.into_iter().map(|id| mem::take(&mut buckets[id])).collect())
        .unwrap_or_default();
    lanes.resize_with(k, Vec::new);
    Ok(lanes)
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::unit::testing::ScriptedUnit;

    fn sums(lanes: &[Vec<usize>], durations: &[u64]) -> Vec<u64> {
        lanes.iter().map(|lane| lane.iter().map(|&i| durations[i]).sum()).collect()
    }

    fn spread(lanes: &[Vec<usize>], durations: &[u64]) -> u64 {
        let sums = sums(lanes, durations);
        sums.iter().max().unwrap() - sums.iter().min().unwrap()
    }

    fn assert_exact_cover(lanes: &[Vec<usize>], n: usize) {
        let mut seen: Vec<usize> = lanes.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());
    }

    fn units(durations: &[Option<u64>]) -> Vec<BoxedUnit> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let unit = ScriptedUnit::passing(&format!("u{i}"));
                match d {
                    Some(secs) => unit.with_expected(*secs).boxed(),
                    None => unit.boxed(),
                }
            })
            .collect()
    }

    #[test]
    fn test_by_count_lane_sizes_differ_by_at_most_one() {
        for (n, k) in [(1, 1), (5, 4), (10, 3), (7, 7), (100, 8)] {
            let partition = by_count(units(&vec![None; n]), k);
            assert_eq!(partition.lanes.len(), k);
            let sizes: Vec<usize> = partition.lanes.iter().map(Vec::len).collect();
            assert_eq!(sizes.iter().sum::<usize>(), n);
            assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
            assert_eq!(partition.max_run_duration, 0);
        }
    }

    #[test]
    fn test_by_count_round_robin_order() {
        let partition = by_count(units(&[None; 5]), 2);
        let ids: Vec<Vec<&str>> = partition
            .lanes
            .iter()
            .map(|lane| lane.iter().map(|u| u.id()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["u0", "u2", "u4"], vec!["u1", "u3"]]);
    }

    #[test]
    fn test_equal_durations_balance_under_both_algorithms() {
        let durations = [10, 10, 10, 10];
        assert_eq!(sums(&greedy(&durations, 2), &durations), vec![20, 20]);
        assert_eq!(sums(&karmarkar_karp(&durations, 2).unwrap(), &durations), vec![20, 20]);

        let partition = by_duration(units(&[Some(10); 4]), 2).unwrap();
        assert_eq!(partition.max_run_duration, 20);
        assert!(partition.lanes.iter().all(|lane| lane.len() == 2));
    }

    #[test]
    fn test_karmarkar_karp_not_worse_than_greedy_on_skewed_inputs() {
        // greedy spreads: 4, 4, 0
        for durations in [vec![8, 7, 6, 5, 4], vec![3, 3, 2, 2, 2], vec![8, 4, 2, 1, 1]] {
            let g = greedy(&durations, 2);
            let kk = karmarkar_karp(&durations, 2).unwrap();
            assert_exact_cover(&g, durations.len());
            assert_exact_cover(&kk, durations.len());
            assert!(
                spread(&kk, &durations) <= spread(&g, &durations),
                "{durations:?}: kk {:?} greedy {:?}",
                sums(&kk, &durations),
                sums(&g, &durations)
            );
        }
        assert_eq!(spread(&karmarkar_karp(&[8, 7, 6, 5, 4], 2).unwrap(), &[8, 7, 6, 5, 4]), 2);
    }

    #[test]
    fn test_random_inputs_are_partitioned_exactly() {
        let mut rng = rand::thread_rng();
        for k in [1, 3, 7, 16] {
            let durations: Vec<u64> = (0..300).map(|_| rng.gen_range(0..1_000)).collect();
            let total: u64 = durations.iter().sum();

            for lanes in [greedy(&durations, k), karmarkar_karp(&durations, k).unwrap()] {
                assert_eq!(lanes.len(), k);
                assert_exact_cover(&lanes, durations.len());
                assert_eq!(sums(&lanes, &durations).iter().sum::<u64>(), total);
            }
        }
    }

    #[test]
    fn test_fewer_durations_than_lanes() {
        let lanes = karmarkar_karp(&[5, 3], 4).unwrap();
        assert_eq!(lanes.len(), 4);
        assert_exact_cover(&lanes, 2);
        assert_eq!(lanes.iter().filter(|lane| lane.is_empty()).count(), 2);
    }

    #[test]
    fn test_smart_partition_rejects_oversized_input() {
        let durations = vec![1; MAX_UNITS + 1];
        assert_eq!(
            smart_partition(&durations, 4),
            Err(PartitionError::TooManyUnits(MAX_UNITS + 1))
        );
    }

    #[test]
    fn test_missing_durations_get_the_median() {
        let partition = by_duration(units(&[Some(1), Some(5), Some(9), None]), 2).unwrap();

        assert_eq!(
            partition.stats,
            Some(DurationStats {
                min: 1,
                median: 5,
                max: 9
            })
        );
        let filled = partition
            .lanes
            .iter()
            .flatten()
            .find(|u| u.id() == "u3")
            .and_then(|u| u.expected_duration());
        assert_eq!(filled, Some(5));
        // 9 + 1 | 5 + 5
        assert_eq!(partition.max_run_duration, 10);
    }

    #[test]
    fn test_no_known_durations_default_to_one_second() {
        let partition = by_duration(units(&[None, None, None]), 3).unwrap();
        assert_eq!(partition.max_run_duration, 1);
        assert_eq!(partition.lanes.len(), 3);
    }

    fn lanes(layout: &[&[(&str, u64)]]) -> Vec<Vec<BoxedUnit>> {
        layout
            .iter()
            .map(|lane| {
                lane.iter()
                    .map(|(id, secs)| ScriptedUnit::passing(id).with_expected(*secs).boxed())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_long_unit_alone_in_its_lane() {
        let layout = lanes(&[&[("A", 100)], &[("B", 1), ("C", 1)]]);
        assert_eq!(long_unit(&layout).map(|u| u.id()), Some("A"));

        let layout = lanes(&[&[("A", 1)], &[("B", 100), ("C", 1)]]);
        assert!(long_unit(&layout).is_none());

        let layout = lanes(&[&[("A", 100)], &[("B", 1)]]);
        assert!(long_unit(&layout).is_none());
    }

    #[test]
    fn test_smart_partition_switches_to_karmarkar_karp() {
        // 16 * 18000 - 256000
        let durations: Vec<u64> = (0..32_000u64).map(|i| i % 97 + 1).collect();
        assert_eq!(
            smart_partition(&durations, 16).unwrap(),
            karmarkar_karp(&durations, 16).unwrap()
        );

        let durations = &durations[..31_999];
        assert_eq!(smart_partition(durations, 16).unwrap(), greedy(durations, 16));
    }

    #[test]
    fn test_lane_count_is_bounded_by_units() {
        assert_eq!(lane_count(8, 3), 3);
        assert_eq!(lane_count(2, 30), 2);
        assert_eq!(lane_count(4, 0), 0);
    }
}
