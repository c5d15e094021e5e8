//! Data differ
//!
//! Reconciles two unordered multisets of row fingerprints for one table.
//! Fingerprints are fed incrementally as each side streams; only counts per
//! distinct fingerprint are retained, bounding memory to O(distinct rows)
//! instead of O(row width x row count). Duplicate rows are handled through
//! per-fingerprint counts, so partial duplication changes are reported
//! exactly.

use crate::hash::RowFingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Row-level diff statistics for one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSetDiff {
    pub row_count_left: u64,
    pub row_count_right: u64,
    /// Rows (by fingerprint occurrence) present only on the right
    pub added_count: u64,
    /// Rows present only on the left
    pub removed_count: u64,
    /// Rows matched on both sides
    pub common_count: u64,
    /// Bounded sample of fingerprints with a right-side surplus
    pub sample_added: Vec<RowFingerprint>,
    /// Bounded sample of fingerprints with a left-side surplus
    pub sample_removed: Vec<RowFingerprint>,
}

impl RowSetDiff {
    pub fn is_empty(&self) -> bool {
        self.added_count == 0 && self.removed_count == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SideCounts {
    left: u64,
    right: u64,
}

/// Streaming accumulator for one table's comparison.
///
/// Private to that table's worker; feed both sides in any order or
/// interleaving, then call [`finish`](Self::finish) once both streams are
/// exhausted.
#[derive(Debug)]
pub struct FingerprintAccumulator {
    counts: HashMap<RowFingerprint, SideCounts>,
    rows_left: u64,
    rows_right: u64,
    sample_size: usize,
}

impl FingerprintAccumulator {
    pub fn new(sample_size: usize) -> Self {
        Self {
            counts: HashMap::new(),
            rows_left: 0,
            rows_right: 0,
            sample_size,
        }
    }

    pub fn record_left(&mut self, fp: RowFingerprint) {
        self.counts.entry(fp).or_default().left += 1;
        self.rows_left += 1;
    }

    pub fn record_right(&mut self, fp: RowFingerprint) {
        self.counts.entry(fp).or_default().right += 1;
        self.rows_right += 1;
    }

    /// Resolve the accumulated counts into a diff. Consumes the accumulator;
    /// the frequency map is dropped here, keeping only aggregate counts and
    /// the bounded samples.
    pub fn finish(self) -> RowSetDiff {
        let mut added = 0u64;
        let mut removed = 0u64;
        let mut common = 0u64;
        let mut sample_added: BTreeSet<RowFingerprint> = BTreeSet::new();
        let mut sample_removed: BTreeSet<RowFingerprint> = BTreeSet::new();

        for (fp, c) in &self.counts {
            common += c.left.min(c.right);
            if c.right > c.left {
                added += c.right - c.left;
                bounded_insert(&mut sample_added, *fp, self.sample_size);
            } else if c.left > c.right {
                removed += c.left - c.right;
                bounded_insert(&mut sample_removed, *fp, self.sample_size);
            }
        }

        RowSetDiff {
            row_count_left: self.rows_left,
            row_count_right: self.rows_right,
            added_count: added,
            removed_count: removed,
            common_count: common,
            sample_added: sample_added.into_iter().collect(),
            sample_removed: sample_removed.into_iter().collect(),
        }
    }
}

/// Keep the `limit` smallest fingerprints: deterministic regardless of map
/// iteration order, and bounded while streaming results out.
fn bounded_insert(set: &mut BTreeSet<RowFingerprint>, fp: RowFingerprint, limit: usize) {
    if limit == 0 {
        return;
    }
    set.insert(fp);
    if set.len() > limit {
        set.pop_last();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fp(n: u128) -> RowFingerprint {
        RowFingerprint(n)
    }

    #[test]
    fn test_identical_sides_yield_empty_diff() {
        let mut acc = FingerprintAccumulator::new(10);
        for n in [1u128, 2, 3] {
            acc.record_left(fp(n));
            acc.record_right(fp(n));
        }
        let diff = acc.finish();

        assert_eq!(diff.added_count, 0);
        assert_eq!(diff.removed_count, 0);
        assert_eq!(diff.common_count, 3);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_duplicate_rows_counted_per_occurrence() {
        // left {A, A, B}, right {A, B, B}
        let mut acc = FingerprintAccumulator::new(10);
        acc.record_left(fp(0xA));
        acc.record_left(fp(0xA));
        acc.record_left(fp(0xB));
        acc.record_right(fp(0xA));
        acc.record_right(fp(0xB));
        acc.record_right(fp(0xB));
        let diff = acc.finish();

        assert_eq!(diff.added_count, 1);
        assert_eq!(diff.removed_count, 1);
        assert_eq!(diff.common_count, 2);
        assert_eq!(diff.sample_added, vec![fp(0xB)]);
        assert_eq!(diff.sample_removed, vec![fp(0xA)]);
    }

    #[test]
    fn test_three_row_drift_scenario() {
        // left (1,"a") (2,"b") (3,"c"); right (1,"a") (2,"bb") (4,"c")
        // distinct content maps to distinct fingerprints
        let mut acc = FingerprintAccumulator::new(10);
        acc.record_left(fp(1));
        acc.record_left(fp(2));
        acc.record_left(fp(3));
        acc.record_right(fp(1));
        acc.record_right(fp(20));
        acc.record_right(fp(30));
        let diff = acc.finish();

        assert_eq!(diff.common_count, 1);
        assert_eq!(diff.removed_count, 2);
        assert_eq!(diff.added_count, 2);
        assert_eq!(diff.row_count_left, 3);
        assert_eq!(diff.row_count_right, 3);
    }

    #[test]
    fn test_symmetry() {
        let feeds: &[(u128, bool)] = &[(1, true), (1, false), (2, true), (3, false), (3, false)];

        let mut forward = FingerprintAccumulator::new(10);
        let mut swapped = FingerprintAccumulator::new(10);
        for &(n, is_left) in feeds {
            if is_left {
                forward.record_left(fp(n));
                swapped.record_right(fp(n));
            } else {
                forward.record_right(fp(n));
                swapped.record_left(fp(n));
            }
        }

        let a = forward.finish();
        let b = swapped.finish();
        assert_eq!(a.added_count, b.removed_count);
        assert_eq!(a.removed_count, b.added_count);
        assert_eq!(a.common_count, b.common_count);
        assert_eq!(a.sample_added, b.sample_removed);
    }

    #[test]
    fn test_interleaved_feeding_order_is_irrelevant() {
        let mut ordered = FingerprintAccumulator::new(10);
        ordered.record_left(fp(1));
        ordered.record_left(fp(2));
        ordered.record_right(fp(2));
        ordered.record_right(fp(3));

        let mut interleaved = FingerprintAccumulator::new(10);
        interleaved.record_right(fp(3));
        interleaved.record_left(fp(2));
        interleaved.record_right(fp(2));
        interleaved.record_left(fp(1));

        assert_eq!(ordered.finish(), interleaved.finish());
    }

    #[test]
    fn test_sample_is_bounded_counts_exact() {
        let mut acc = FingerprintAccumulator::new(3);
        for n in 0..100u128 {
            acc.record_right(fp(n));
        }
        let diff = acc.finish();

        assert_eq!(diff.added_count, 100);
        assert_eq!(diff.sample_added.len(), 3);
        // deterministic: the smallest fingerprints survive
        assert_eq!(diff.sample_added, vec![fp(0), fp(1), fp(2)]);
    }

    #[test]
    fn test_zero_sample_size() {
        let mut acc = FingerprintAccumulator::new(0);
        acc.record_left(fp(1));
        let diff = acc.finish();
        assert_eq!(diff.removed_count, 1);
        assert!(diff.sample_removed.is_empty());
    }
}
