//! LETHE - Range merge
//!
//! Level merge keeps adding sorted runs at the bottom levels. After each
//! last-level compaction the run depth over the compacted range is
//! measured; when it exceeds `max_sorted_runs`, the oldest files covering
//! the deepest point are marked so the next GC cycle merges them first.

use std::sync::Arc;

use super::blob::BlobFileHandle;
use super::lsm::compaction::KeyRange;
use super::metrics::EngineMetrics;
use super::EngineCore;
use crate::types::Key;

/// Deepest overlap among `ranges` and a key where it occurs.
pub fn deepest_point(ranges: &[KeyRange]) -> Option<(usize, Key)> {
    // Ranges are inclusive: at equal keys, starts sort before ends.
    let mut bounds: Vec<(&[u8], bool)> = Vec::with_capacity(ranges.len() * 2);
    for range in ranges {
        bounds.push((&range.smallest, true));
        bounds.push((&range.largest, false));
    }
    bounds.sort_by(|a, b| a.0.cmp(b.0).then(b.1.cmp(&a.1)));

    let mut depth = 0usize;
    let mut best: Option<(usize, Key)> = None;
    for (key, is_start) in bounds {
        if is_start {
            depth += 1;
            if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                best = Some((depth, key.to_vec()));
            }
        } else {
            depth -= 1;
        }
    }
    best
}

/// Sorted-run depth of the bottom two levels over `range`, or over every
/// key when `range` is `None`.
pub fn run_depth(core: &EngineCore, range: Option<&KeyRange>) -> usize {
    let ranges: Vec<KeyRange> = core
        .files
        .sorted_runs(range, core.config.num_levels().saturating_sub(2))
        .iter()
        .filter_map(|f| f.range())
        .collect();
    deepest_point(&ranges).map_or(0, |(depth, _)| depth)
}

/// Mark files for merging if `range` is too deep. Returns how many files
/// were newly marked.
pub fn check(core: &EngineCore, range: &KeyRange) -> usize {
    let max_runs = core.config.max_sorted_runs();
    let files = core
        .files
        .sorted_runs(Some(range), core.config.num_levels().saturating_sub(2));
    let ranges: Vec<KeyRange> = files.iter().filter_map(|f| f.range()).collect();
    let Some((depth, point)) = deepest_point(&ranges) else {
        return 0;
    };
    if depth <= max_runs {
        return 0;
    }

    let mut covering: Vec<&Arc<BlobFileHandle>> = files
        .iter()
        .filter(|f| f.range().map_or(false, |r| r.contains(&point)))
        .collect();
    covering.sort_by_key(|f| f.creation_sequence());

    let mut marked = 0;
    for file in covering.into_iter().take(depth - max_runs + 1) {
        if file.mark_for_merge() {
            marked += 1;
        }
    }
    EngineMetrics::add(&core.metrics.range_merge_marks, marked as u64);
    log::info!(
        "range merge: depth {} exceeds {} sorted runs, marked {} files",
        depth,
        max_runs,
        marked
    );
    marked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(a.as_bytes().to_vec(), b.as_bytes().to_vec())
    }

    #[test]
    fn test_deepest_point_of_overlapping_runs() {
        let ranges = vec![range("a", "f"), range("c", "k"), range("e", "z"), range("m", "p")];
        let (depth, point) = deepest_point(&ranges).unwrap();
        assert_eq!(depth, 3);
        assert_eq!(point, b"e".to_vec());
    }

    #[test]
    fn test_touching_ranges_overlap() {
        let (depth, _) = deepest_point(&[range("a", "c"), range("c", "e")]).unwrap();
        assert_eq!(depth, 2);
    }

    #[test]
    fn test_disjoint_ranges_have_depth_one() {
        let (depth, _) = deepest_point(&[range("a", "b"), range("c", "d")]).unwrap();
        assert_eq!(depth, 1);
        assert!(deepest_point(&[]).is_none());
    }
}
