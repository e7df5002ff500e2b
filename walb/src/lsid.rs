//! The lsid counters that track how far a write has progressed through the
//! pipeline, and the monotonicity invariant binding them together:
//! `oldest <= written <= permanent <= completed <= submitted <= latest`,
//! and `latest - oldest <= ring_buffer_size`.

use crate::geometry::Geometry;

/// The six watermarks of the write pipeline, plus the `READ_ONLY` and
/// `LOG_OVERFLOW` latches.
///
/// `latest` is bumped by the single-threaded build stage as each pack is
/// finalized; `submitted`/`completed` track log-device durability;
/// `permanent` tracks the periodic log-flush boundary; `written` is the
/// value last persisted into the super sector by the checkpointer.
///
/// `read_only` and `log_overflow` are distinct latches (§3/§7): an I/O
/// failure latches only `read_only`, while a ring-buffer overflow latches
/// both (overflow always halts writes too, but a plain I/O failure must not
/// be reported back as `LOG_OVERFLOW`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsidCounters {
    pub oldest: u64,
    pub written: u64,
    pub permanent: u64,
    pub completed: u64,
    pub submitted: u64,
    pub latest: u64,
    pub read_only: bool,
    pub log_overflow: bool,
}

impl LsidCounters {
    #[must_use]
    pub const fn new(start_lsid: u64) -> Self {
        Self {
            oldest: start_lsid,
            written: start_lsid,
            permanent: start_lsid,
            completed: start_lsid,
            submitted: start_lsid,
            latest: start_lsid,
            read_only: false,
            log_overflow: false,
        }
    }

    /// Whether the ordering invariant currently holds.
    #[must_use]
    pub const fn is_well_ordered(&self) -> bool {
        self.oldest <= self.written
            && self.written <= self.permanent
            && self.permanent <= self.completed
            && self.completed <= self.submitted
            && self.submitted <= self.latest
    }

    /// Bytes of log currently in use, in `pb`.
    #[must_use]
    pub const fn log_usage_pb(&self) -> u64 {
        self.latest - self.oldest
    }

    /// Remaining ring capacity, in `pb`, before the next pack would overflow.
    #[must_use]
    pub const fn log_capacity_pb(&self, geometry_ring_buffer_size: u64) -> u64 {
        geometry_ring_buffer_size - self.log_usage_pb()
    }

    /// Whether admitting a pack spanning `additional_pb` more would overflow the ring.
    #[must_use]
    pub const fn would_overflow(&self, additional_pb: u64, ring_buffer_size: u64) -> bool {
        self.latest - self.oldest + additional_pb > ring_buffer_size
    }

    /// Advance `latest` past a newly finalized pack ending at `end_lsid`.
    pub fn advance_latest(&mut self, end_lsid: u64) {
        debug_assert!(end_lsid >= self.latest);
        self.latest = end_lsid;
    }

    /// Advance `submitted` once a pack's log writes have all been issued.
    pub fn advance_submitted(&mut self, end_lsid: u64) {
        debug_assert!(end_lsid >= self.submitted);
        self.submitted = end_lsid;
    }

    /// Advance `completed` to the largest lsid such that every pack up to it
    /// has completed on the log device. Packs may complete out of order;
    /// callers must only pass a prefix-complete value.
    pub fn advance_completed(&mut self, end_lsid: u64) {
        debug_assert!(end_lsid >= self.completed);
        self.completed = end_lsid;
    }

    /// Advance `permanent` after a log-device flush, never past `completed`.
    pub fn advance_permanent(&mut self) {
        self.permanent = self.completed;
    }

    /// Advance `written` after a checkpoint, to `min(permanent, completed)`.
    pub fn advance_written(&mut self) {
        self.written = self.permanent.min(self.completed);
    }

    /// Release log space behind `new_oldest`, called by `set_oldest_lsid`.
    pub fn advance_oldest(&mut self, new_oldest: u64) {
        debug_assert!(new_oldest <= self.written);
        self.oldest = new_oldest;
    }

    pub fn latch_read_only(&mut self) {
        self.read_only = true;
    }

    /// Latch both `log_overflow` and `read_only`: a ring-buffer overflow
    /// always halts writes, but is reported as a distinct error kind from a
    /// plain I/O failure.
    pub fn latch_log_overflow(&mut self) {
        self.log_overflow = true;
        self.read_only = true;
    }
}

/// Check whether admitting a pack of `additional_pb` more log space would
/// overflow the ring given `geometry`, returning an error-shaped bool rather
/// than mutating — used by the admission stage before it commits to a pack.
#[must_use]
pub fn checks_overflow(counters: &LsidCounters, additional_pb: u64, geometry: &Geometry) -> bool {
    counters.would_overflow(additional_pb, geometry.ring_buffer_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_counters_are_well_ordered() {
        assert!(LsidCounters::new(0).is_well_ordered());
        assert!(LsidCounters::new(42).is_well_ordered());
    }

    #[test]
    fn advancing_in_pipeline_order_preserves_invariant() {
        let mut c = LsidCounters::new(0);
        c.advance_latest(10);
        c.advance_submitted(10);
        c.advance_completed(10);
        c.advance_permanent();
        c.advance_written();
        assert!(c.is_well_ordered());
        assert_eq!(c.written, 10);
    }

    #[test]
    fn overflow_check_respects_ring_buffer_size() {
        let mut c = LsidCounters::new(0);
        c.advance_latest(90);
        assert!(!c.would_overflow(10, 100));
        assert!(c.would_overflow(11, 100));
    }

    #[test]
    fn log_usage_and_capacity_are_complementary() {
        let mut c = LsidCounters::new(0);
        c.advance_latest(30);
        assert_eq!(c.log_usage_pb(), 30);
        assert_eq!(c.log_capacity_pb(100), 70);
    }
}
