//! Periodic checkpointing: persists `written_lsid = min(permanent_lsid,
//! completed_lsid)` into both super sector copies (§4.5 stage 7).

use std::time::{Duration, Instant};

use crate::device::BlockDevice;
use crate::error::WalbError;
use crate::format::SuperSector;
use crate::geometry::Geometry;
use crate::lsid::LsidCounters;

/// When the background checkpointer should fire.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// `0` disables periodic checkpointing; callers may still force one.
    pub interval_ms: u64,
}

impl CheckpointConfig {
    #[must_use]
    pub const fn new(interval_ms: u64) -> Self {
        Self { interval_ms }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { interval_ms: 0 }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

/// Tracks when the last checkpoint ran.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointState {
    last_checkpoint_at: Option<Instant>,
    pub last_written_lsid: u64,
}

impl CheckpointState {
    #[must_use]
    pub const fn new(start_lsid: u64) -> Self {
        Self {
            last_checkpoint_at: None,
            last_written_lsid: start_lsid,
        }
    }

    #[must_use]
    pub fn should_checkpoint(&self, config: &CheckpointConfig, now: Instant) -> bool {
        if config.interval_ms == 0 {
            return false;
        }
        match self.last_checkpoint_at {
            None => true,
            Some(t) => now.duration_since(t) >= Duration::from_millis(config.interval_ms),
        }
    }
}

/// Write `written_lsid = min(permanent, completed)` into both super sector
/// copies and update `state` unconditionally.
pub fn force_checkpoint(
    log: &dyn BlockDevice,
    super_sector: &mut SuperSector,
    geometry: &Geometry,
    counters: &LsidCounters,
    state: &mut CheckpointState,
    now: Instant,
) -> Result<(), WalbError> {
    let written_lsid = counters.permanent.min(counters.completed);
    super_sector.written_lsid = written_lsid;
    super_sector.oldest_lsid = counters.oldest;

    let sector = super_sector.to_sector()?;
    let primary_pb = 1u64;
    let secondary_pb = 1 + 2 * u64::from(geometry.snapshot_metadata_size);
    log.write_at(primary_pb, sector.as_bytes())?;
    log.write_at(secondary_pb, sector.as_bytes())?;
    log.flush()?;

    state.last_written_lsid = written_lsid;
    state.last_checkpoint_at = Some(now);
    Ok(())
}

/// Run a checkpoint only if `state.should_checkpoint` says it is due.
pub fn maybe_checkpoint(
    log: &dyn BlockDevice,
    super_sector: &mut SuperSector,
    geometry: &Geometry,
    counters: &LsidCounters,
    config: &CheckpointConfig,
    state: &mut CheckpointState,
    now: Instant,
) -> Result<bool, WalbError> {
    if !state.should_checkpoint(config, now) {
        return Ok(false);
    }
    force_checkpoint(log, super_sector, geometry, counters, state, now)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn super_sector() -> SuperSector {
        SuperSector::new(512, 4096, 0, [1u8; 16], "walb0".to_string(), 0, 1000)
    }

    fn geometry() -> Geometry {
        Geometry::new(512, 4096, 0, 1000).unwrap()
    }

    #[test]
    fn disabled_config_never_fires() {
        let state = CheckpointState::new(0);
        let config = CheckpointConfig::disabled();
        assert!(!state.should_checkpoint(&config, Instant::now()));
    }

    #[test]
    fn force_checkpoint_persists_min_of_permanent_and_completed() {
        let log = MemDevice::new(4096, 1000);
        let mut s = super_sector();
        let g = geometry();
        let mut counters = LsidCounters::new(0);
        counters.advance_latest(50);
        counters.advance_submitted(50);
        counters.advance_completed(50);
        counters.advance_permanent();
        counters.completed = 80;
        let mut state = CheckpointState::new(0);

        force_checkpoint(&log, &mut s, &g, &counters, &mut state, Instant::now()).unwrap();
        assert_eq!(s.written_lsid, 50);
        assert_eq!(state.last_written_lsid, 50);

        let mut primary = vec![0u8; 4096];
        log.read_at(1, &mut primary).unwrap();
        let read_back = SuperSector::from_sector(&crate::sector::SectorBuf::from_vec(primary, 4096).unwrap()).unwrap();
        assert_eq!(read_back.written_lsid, 50);
    }

    #[test]
    fn maybe_checkpoint_respects_interval() {
        let log = MemDevice::new(4096, 1000);
        let mut s = super_sector();
        let g = geometry();
        let counters = LsidCounters::new(0);
        let config = CheckpointConfig::new(1000);
        let mut state = CheckpointState::new(0);
        let t0 = Instant::now();

        assert!(maybe_checkpoint(&log, &mut s, &g, &counters, &config, &mut state, t0).unwrap());
        assert!(!maybe_checkpoint(&log, &mut s, &g, &counters, &config, &mut state, t0).unwrap());
    }
}
