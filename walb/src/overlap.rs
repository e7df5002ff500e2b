//! Tracks logical-block ranges of writes that are log-durable but not yet
//! data-durable, so the data-submit stage can withhold a write until every
//! overlapping predecessor has completed (§4.4).
//!
//! Ranges are keyed by their starting offset in a `BTreeMap`, which gives
//! `range(..end)` pruning of any candidate whose start falls past the query
//! window for free; the remaining linear filter only runs over that pruned
//! candidate set.

use std::collections::BTreeMap;

/// The set of data-device ranges currently in flight.
#[derive(Debug, Default)]
pub struct OverlapTracker {
    by_start: BTreeMap<u64, u64>,
}

impl OverlapTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[start, start+size)` as in flight.
    pub fn insert(&mut self, start: u64, size: u64) {
        self.by_start.insert(start, start + size);
    }

    /// Stop tracking the range beginning at `start`.
    pub fn remove(&mut self, start: u64) {
        self.by_start.remove(&start);
    }

    /// Whether `[start, start+size)` overlaps any tracked range.
    #[must_use]
    pub fn any_overlap(&self, start: u64, size: u64) -> bool {
        let end = start + size;
        self.by_start.range(..end).any(|(&s, &e)| e > start && s < end)
    }

    /// Every tracked range overlapping `[start, start+size)`.
    pub fn overlapping(&self, start: u64, size: u64) -> Vec<(u64, u64)> {
        let end = start + size;
        self.by_start
            .range(..end)
            .filter(|&(&s, &e)| e > start && s < end)
            .map(|(&s, &e)| (s, e))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_overlap() {
        let mut t = OverlapTracker::new();
        t.insert(100, 8);
        assert!(t.any_overlap(104, 8));
        assert!(t.any_overlap(90, 20));
        assert!(!t.any_overlap(108, 8));
        assert!(!t.any_overlap(80, 20));
    }

    #[test]
    fn chain_of_three_overlapping_writes() {
        let mut t = OverlapTracker::new();
        t.insert(0, 16);
        t.insert(8, 16);
        assert!(t.any_overlap(16, 16));
        assert_eq!(t.overlapping(16, 16).len(), 1);

        t.remove(0);
        assert!(t.any_overlap(16, 16));
        t.remove(8);
        assert!(!t.any_overlap(16, 16));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let mut t = OverlapTracker::new();
        t.insert(0, 8);
        assert!(!t.any_overlap(8, 8));
    }

    #[test]
    fn empty_tracker_reports_no_overlap() {
        let t = OverlapTracker::new();
        assert!(t.is_empty());
        assert!(!t.any_overlap(0, 100));
    }
}
