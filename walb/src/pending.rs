//! Holds write payloads between log-durability and data-durability so that
//! concurrent reads can be served from memory instead of the not-yet-written
//! data device (§4.4).

use std::collections::BTreeMap;
use std::sync::Arc;

/// A write payload awaiting submission (or completion) on the data device.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub lsid: u64,
    pub payload: Arc<[u8]>,
}

/// Ranges keyed by their starting logical-block offset, so a read can find
/// the most recent pending payload covering any overlapping byte range.
#[derive(Debug, Default)]
pub struct PendingSet {
    by_start: BTreeMap<u64, PendingEntry>,
}

impl PendingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, start: u64, entry: PendingEntry) {
        self.by_start.insert(start, entry);
    }

    pub fn remove(&mut self, start: u64) -> Option<PendingEntry> {
        self.by_start.remove(&start)
    }

    /// The pending entry starting at exactly `start`, if any.
    #[must_use]
    pub fn get(&self, start: u64) -> Option<&PendingEntry> {
        self.by_start.get(&start)
    }

    /// Entries overlapping `[start, start+size)`, in ascending start order
    /// (later inserts for the same range win on replay by construction,
    /// since a write is only ever pending once its predecessor completed).
    #[must_use]
    pub fn overlapping(&self, start: u64, size: u64) -> Vec<&PendingEntry> {
        let end = start + size;
        self.by_start
            .range(..end)
            .filter(|(&s, e)| s + e.payload.len() as u64 > start)
            .map(|(_, e)| e)
            .collect()
    }

    /// `pb` of pending log space currently buffered, used by the admission
    /// stage's backpressure thresholds.
    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        self.by_start.values().map(|e| e.payload.len() as u64).sum()
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
