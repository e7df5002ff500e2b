//! The control surface (§6): `format_log`, `attach`/`detach`, lsid
//! getters/setters, usage/capacity queries, freeze/melt, checkpointing,
//! `search_valid_lsid`, `get_version`, and `StartParams`.
#![allow(clippy::cast_possible_truncation)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, CheckpointConfig, CheckpointState};
use crate::device::BlockDevice;
use crate::error::WalbError;
use crate::format::{LogpackHeader, SuperSector};
use crate::freeze::{FreezeController, FreezeState};
use crate::geometry::Geometry;
use crate::lsid::LsidCounters;
use crate::pipeline::{PipelineConfig, WritePipeline};
use crate::redo;

pub const VERSION: (u16, u16, u16) = (1, 0, 0);

/// Start parameters (§6 "Start-parameters"), with the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    pub max_logpack_kb: u32,
    pub max_pending_mb: u32,
    pub min_pending_mb: u32,
    pub queue_stop_timeout_ms: u64,
    pub log_flush_interval_mb: u32,
    pub log_flush_interval_ms: u64,
    pub n_pack_bulk: usize,
    pub n_io_bulk: usize,
    pub name: String,
}

impl Default for StartParams {
    fn default() -> Self {
        Self {
            max_logpack_kb: 1024,
            max_pending_mb: 32,
            min_pending_mb: 16,
            queue_stop_timeout_ms: 100,
            log_flush_interval_mb: 16,
            log_flush_interval_ms: 100,
            n_pack_bulk: 128,
            n_io_bulk: 1024,
            name: "walb0".to_string(),
        }
    }
}

impl StartParams {
    /// `min_pending_mb < max_pending_mb`, and every size field is nonzero.
    pub fn validate(&self) -> Result<(), WalbError> {
        if self.min_pending_mb >= self.max_pending_mb {
            return Err(WalbError::InvalidArg(format!(
                "min_pending_mb ({}) must be less than max_pending_mb ({})",
                self.min_pending_mb, self.max_pending_mb
            )));
        }
        if self.max_logpack_kb == 0 {
            return Err(WalbError::InvalidArg("max_logpack_kb must be nonzero".into()));
        }
        if self.n_pack_bulk == 0 || self.n_io_bulk == 0 {
            return Err(WalbError::InvalidArg("n_pack_bulk and n_io_bulk must be nonzero".into()));
        }
        if self.name.is_empty() {
            return Err(WalbError::InvalidArg("name must not be empty".into()));
        }
        Ok(())
    }

    fn to_pipeline_config(&self, physical_bs: u32, nodiscard: bool) -> PipelineConfig {
        let max_logpack_pb = (u64::from(self.max_logpack_kb) * 1024 / u64::from(physical_bs)).max(1) as u16;
        PipelineConfig {
            max_logpack_pb,
            max_pending_bytes: u64::from(self.max_pending_mb) * 1024 * 1024,
            min_pending_bytes: u64::from(self.min_pending_mb) * 1024 * 1024,
            queue_stop_timeout: Duration::from_millis(self.queue_stop_timeout_ms),
            log_flush_interval_pb: (u64::from(self.log_flush_interval_mb) * 1024 * 1024) / u64::from(physical_bs),
            log_flush_interval: Duration::from_millis(self.log_flush_interval_ms),
            n_pack_bulk: self.n_pack_bulk,
            nodiscard,
        }
    }
}

/// Returned by `attach`. `major`/`minor` are synthetic device identifiers
/// (there is no kernel module here) kept so embedders can key a handle by
/// something stable across detach/reattach; `minor` increments per attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachHandle {
    pub major: u32,
    pub minor: u32,
    pub name: String,
}

static NEXT_MINOR: AtomicU32 = AtomicU32::new(1);

/// A fresh random uuid for `format_log`, the way `mkfs`-style tooling mints one.
#[must_use]
pub fn random_uuid() -> [u8; 16] {
    rand::random()
}

/// A fresh random checksum salt for `format_log`.
#[must_use]
pub fn random_salt() -> u32 {
    rand::random()
}

/// Write a fresh super sector (both copies) and an end-of-log marker at lsid 0.
pub fn format_log(
    log: &dyn BlockDevice,
    geometry: &Geometry,
    uuid: [u8; 16],
    name: String,
    salt: u32,
) -> Result<(), WalbError> {
    tracing::info!(name = %name, "formatting log device");
    let mut super_sector = SuperSector::new(
        geometry.logical_bs,
        geometry.physical_bs,
        geometry.snapshot_metadata_size,
        uuid,
        name,
        salt,
        geometry.ring_buffer_size,
    );
    super_sector.oldest_lsid = 0;
    super_sector.written_lsid = 0;
    let sector = super_sector.to_sector()?;

    let secondary_pb = 1 + 2 * u64::from(geometry.snapshot_metadata_size);
    log.write_at(1, sector.as_bytes())?;
    log.write_at(secondary_pb, sector.as_bytes())?;

    let end_marker = LogpackHeader::end_marker(0).to_sector(geometry.physical_bs as usize, salt)?;
    log.write_at(geometry.offset_of_lsid(0), end_marker.as_bytes())?;
    log.flush()?;
    Ok(())
}

struct SuperSectors {
    geometry: Geometry,
    salt: u32,
    primary: SuperSector,
}

fn read_and_reconcile_supers(log: &dyn BlockDevice) -> Result<SuperSectors, WalbError> {
    let primary_pb = 1u64;

    // Neither the physical block size nor the snapshot metadata size (which
    // fixes the secondary's offset) is known yet, so probe with the smallest
    // legal sector (512 B) first to read just enough of the primary's header
    // to learn both.
    let mut probe = vec![0u8; 512];
    log.read_at(primary_pb, &mut probe)?;
    let physical_bs = u32::from_le_bytes([probe[14], probe[15], probe[16], probe[17]]);
    let physical_bs = if physical_bs == 0 { 512 } else { physical_bs as usize };
    let snapshot_metadata_size = u32::from_le_bytes([probe[18], probe[19], probe[20], probe[21]]);
    let secondary_pb = 1 + 2 * u64::from(snapshot_metadata_size);

    let mut primary_buf = vec![0u8; physical_bs];
    log.read_at(primary_pb, &mut primary_buf)?;
    let mut secondary_buf = vec![0u8; physical_bs];
    log.read_at(secondary_pb, &mut secondary_buf)?;

    let primary_sector = crate::sector::SectorBuf::from_vec(primary_buf, physical_bs)
        .map_err(|_| WalbError::BadFormat(crate::error::FormatError::Truncated { expected: physical_bs, actual: 0 }))?;
    let secondary_sector = crate::sector::SectorBuf::from_vec(secondary_buf, physical_bs)
        .map_err(|_| WalbError::BadFormat(crate::error::FormatError::Truncated { expected: physical_bs, actual: 0 }))?;

    let primary = SuperSector::from_sector(&primary_sector);
    let secondary = SuperSector::from_sector(&secondary_sector);

    let (winner, winner_is_primary) = match (primary, secondary) {
        (Ok(p), Ok(s)) => {
            if p.written_lsid >= s.written_lsid {
                (p, true)
            } else {
                (s, false)
            }
        }
        (Ok(p), Err(_)) => (p, true),
        (Err(_), Ok(s)) => (s, false),
        (Err(e), Err(_)) => return Err(WalbError::BadFormat(e)),
    };

    // Open Question 3: the losing slot is always resynced onto the winner's
    // image, whether it was corrupt or merely stale-but-valid.
    let sector = winner.to_sector()?;
    let repair_pb = if winner_is_primary { secondary_pb } else { primary_pb };
    log.write_at(repair_pb, sector.as_bytes())?;
    log.flush()?;

    let geometry = Geometry::new(
        winner.logical_bs,
        winner.physical_bs,
        winner.snapshot_metadata_size,
        winner.ring_buffer_size,
    )?;
    Ok(SuperSectors {
        geometry,
        salt: winner.log_checksum_salt,
        primary: winner,
    })
}

/// One attached (log device, data device) pair and its running pipeline.
pub struct Engine {
    name: Mutex<String>,
    geometry: Geometry,
    salt: u32,
    uuid: [u8; 16],
    log: Arc<dyn BlockDevice>,
    data: Arc<dyn BlockDevice>,
    freeze_controller: Arc<FreezeController>,
    pipeline: Mutex<Option<WritePipeline>>,
    super_sector: Mutex<SuperSector>,
    checkpoint_config: Mutex<CheckpointConfig>,
    checkpoint_state: Mutex<CheckpointState>,
    nodiscard: bool,
}

impl Engine {
    /// Read both super sectors, reconcile them, run redo, and start the
    /// write pipeline from the recovered `written_lsid`.
    pub fn attach(
        log: Arc<dyn BlockDevice>,
        data: Arc<dyn BlockDevice>,
        start_params: &StartParams,
        nodiscard: bool,
    ) -> Result<(Arc<Self>, AttachHandle), WalbError> {
        start_params.validate()?;
        let freeze_controller = FreezeController::new();
        freeze_controller.enter_deep_freeze();

        let supers = read_and_reconcile_supers(log.as_ref())?;
        tracing::info!(written_lsid = supers.primary.written_lsid, "running redo");
        let redo_result = redo::redo(
            log.as_ref(),
            data.as_ref(),
            &supers.geometry,
            supers.salt,
            supers.primary.written_lsid,
        )?;
        tracing::info!(
            packs = redo_result.packs_replayed,
            records = redo_result.records_replayed,
            "redo complete"
        );

        let pipeline_config = start_params.to_pipeline_config(supers.geometry.physical_bs, nodiscard);
        let pipeline = WritePipeline::spawn(
            supers.geometry,
            supers.salt,
            Arc::clone(&log),
            Arc::clone(&data),
            pipeline_config,
            redo_result.end_lsid,
        );

        let mut super_sector = supers.primary.clone();
        super_sector.written_lsid = redo_result.end_lsid;

        let minor = NEXT_MINOR.fetch_add(1, Ordering::SeqCst);
        let handle = AttachHandle {
            major: 0,
            minor,
            name: start_params.name.clone(),
        };

        let engine = Arc::new(Self {
            name: Mutex::new(start_params.name.clone()),
            geometry: supers.geometry,
            salt: supers.salt,
            uuid: super_sector.uuid,
            log,
            data,
            freeze_controller: Arc::clone(&freeze_controller),
            pipeline: Mutex::new(Some(pipeline)),
            super_sector: Mutex::new(super_sector),
            checkpoint_config: Mutex::new(CheckpointConfig::new(start_params.log_flush_interval_ms.max(1))),
            checkpoint_state: Mutex::new(CheckpointState::new(redo_result.end_lsid)),
            nodiscard,
        });
        freeze_controller.exit_deep_freeze();
        Ok((engine, handle))
    }

    fn lock_pipeline(&self) -> Result<std::sync::MutexGuard<'_, Option<WritePipeline>>, WalbError> {
        Ok(self.pipeline.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    fn pipeline_handle(&self) -> Result<WritePipeline, WalbError> {
        self.lock_pipeline()?
            .clone()
            .ok_or_else(|| WalbError::State("engine is detached".into()))
    }

    /// Stop accepting new writes and drop the pipeline's build channel,
    /// letting the build task flush any staged pack and exit.
    pub fn detach(&self) -> Result<(), WalbError> {
        tracing::info!("detaching");
        let mut guard = self.lock_pipeline()?;
        if guard.take().is_none() {
            return Err(WalbError::State("already detached".into()));
        }
        Ok(())
    }

    pub async fn submit_write(
        &self,
        offset: u64,
        io_size_lb: u16,
        payload: Arc<[u8]>,
        flush: bool,
        fua: bool,
    ) -> Result<(), WalbError> {
        if self.freeze_controller.is_frozen() {
            return Err(WalbError::State("device is frozen".into()));
        }
        let pipeline = self.pipeline_handle()?;
        let result = pipeline.submit_write(offset, io_size_lb, payload, flush, fua).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "write failed");
        }
        result
    }

    /// Serve a read from pending (not-yet-data-durable) payload if an exact
    /// match exists, otherwise from the data device.
    pub fn read(&self, offset: u64, io_size_lb: u16) -> Result<Vec<u8>, WalbError> {
        let len = io_size_lb as usize * self.geometry.logical_bs as usize;
        if let Ok(pipeline) = self.pipeline_handle() {
            if let Some(payload) = pipeline.pending_at(offset) {
                if payload.len() == len {
                    return Ok(payload.to_vec());
                }
            }
        }
        let mut buf = vec![0u8; len];
        self.data.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn set_oldest_lsid(&self, lsid: u64) -> Result<(), WalbError> {
        let pipeline = self.pipeline_handle()?;
        if lsid > pipeline.counters().written {
            return Err(WalbError::InvalidArg("oldest_lsid must not exceed written_lsid".into()));
        }
        pipeline.set_oldest_lsid(lsid);
        Ok(())
    }

    fn counters(&self) -> Result<LsidCounters, WalbError> {
        Ok(self.pipeline_handle()?.counters())
    }

    pub fn get_oldest_lsid(&self) -> Result<u64, WalbError> {
        Ok(self.counters()?.oldest)
    }

    pub fn get_written_lsid(&self) -> Result<u64, WalbError> {
        Ok(self.counters()?.written)
    }

    pub fn get_permanent_lsid(&self) -> Result<u64, WalbError> {
        Ok(self.counters()?.permanent)
    }

    pub fn get_completed_lsid(&self) -> Result<u64, WalbError> {
        Ok(self.counters()?.completed)
    }

    pub fn get_log_usage(&self) -> Result<u64, WalbError> {
        Ok(self.counters()?.log_usage_pb())
    }

    #[must_use]
    pub fn get_log_capacity(&self) -> u64 {
        self.geometry.ring_buffer_size
    }

    #[must_use]
    pub fn is_flush_capable(&self) -> bool {
        true
    }

    pub fn is_log_overflow(&self) -> Result<bool, WalbError> {
        Ok(self.counters()?.log_overflow)
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.freeze_controller.is_frozen()
    }

    #[must_use]
    pub fn freeze_state(&self) -> FreezeState {
        self.freeze_controller.state()
    }

    /// Grow the ring buffer's logical view by extending `ring_buffer_size`;
    /// shrinking is rejected since it could strand data below `oldest_lsid`.
    pub fn resize(&self, new_ring_buffer_size: u64) -> Result<(), WalbError> {
        if new_ring_buffer_size < self.geometry.ring_buffer_size {
            return Err(WalbError::InvalidArg(
                "resize cannot shrink ring_buffer_size".into(),
            ));
        }
        Err(WalbError::State(
            "resize requires detach/reattach with updated geometry".into(),
        ))
    }

    /// Clear the `READ_ONLY` latch after a `LogOverflow` or I/O failure.
    pub fn reset_log(&self) -> Result<(), WalbError> {
        tracing::warn!("resetting log READ_ONLY latch");
        self.pipeline_handle()?.reset_read_only();
        Ok(())
    }

    pub fn freeze(&self, timeout: Option<Duration>) -> Result<(), WalbError> {
        tracing::info!(?timeout, "freeze requested");
        self.freeze_controller.freeze(timeout)
    }

    pub fn melt(&self) -> Result<(), WalbError> {
        tracing::info!("melt requested");
        self.freeze_controller.melt()
    }

    pub fn take_checkpoint(&self) -> Result<(), WalbError> {
        let counters = self.counters()?;
        let mut super_sector = lock(&self.super_sector);
        let mut state = lock(&self.checkpoint_state);
        checkpoint::force_checkpoint(
            self.log.as_ref(),
            &mut super_sector,
            &self.geometry,
            &counters,
            &mut state,
            Instant::now(),
        )
    }

    pub fn maybe_take_checkpoint(&self) -> Result<bool, WalbError> {
        let counters = self.counters()?;
        let config = *lock(&self.checkpoint_config);
        let mut super_sector = lock(&self.super_sector);
        let mut state = lock(&self.checkpoint_state);
        checkpoint::maybe_checkpoint(
            self.log.as_ref(),
            &mut super_sector,
            &self.geometry,
            &counters,
            &config,
            &mut state,
            Instant::now(),
        )
    }

    pub fn set_checkpoint_interval_ms(&self, interval_ms: u64) {
        *lock(&self.checkpoint_config) = CheckpointConfig::new(interval_ms);
    }

    #[must_use]
    pub fn get_checkpoint_interval_ms(&self) -> u64 {
        lock(&self.checkpoint_config).interval_ms
    }

    #[must_use]
    pub fn log_flush_interval_ms(&self) -> u64 {
        self.pipeline_handle()
            .map(|p| p.log_flush_interval_ms())
            .unwrap_or(0)
    }

    /// Scan `[start, start + window_pb)` for the first `pb` holding a valid
    /// (checksum-verified) logpack header.
    pub fn search_valid_lsid(&self, start: u64, window_pb: u64) -> Result<Option<u64>, WalbError> {
        let pbs = self.geometry.physical_bs as usize;
        for lsid in start..start + window_pb {
            let phys_offset = self.geometry.offset_of_lsid(lsid);
            let mut buf = vec![0u8; pbs];
            if self.log.read_at(phys_offset, &mut buf).is_err() {
                continue;
            }
            let Ok(sector) = crate::sector::SectorBuf::from_vec(buf, pbs) else {
                continue;
            };
            if LogpackHeader::from_sector(&sector, self.salt).is_ok() {
                return Ok(Some(lsid));
            }
        }
        Ok(None)
    }

    #[must_use]
    pub fn get_version() -> (u16, u16, u16) {
        VERSION
    }

    #[must_use]
    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    #[must_use]
    pub fn nodiscard(&self) -> bool {
        self.nodiscard
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn devices() -> (Arc<dyn BlockDevice>, Arc<dyn BlockDevice>) {
        let log: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096, 10_000));
        let data: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(512, 10_000));
        (log, data)
    }

    fn geometry() -> Geometry {
        Geometry::new(512, 4096, 0, 10_000).unwrap()
    }

    #[test]
    fn start_params_rejects_inverted_pending_bounds() {
        let mut params = StartParams::default();
        params.min_pending_mb = 64;
        params.max_pending_mb = 32;
        assert!(params.validate().is_err());
    }

    #[test]
    fn start_params_defaults_validate() {
        assert!(StartParams::default().validate().is_ok());
    }

    #[tokio::test]
    async fn format_then_attach_starts_at_zero() {
        let (log, data) = devices();
        format_log(log.as_ref(), &geometry(), [1u8; 16], "walb0".to_string(), 0).unwrap();

        let params = StartParams::default();
        let (engine, handle) = Engine::attach(log, data, &params, false).unwrap();
        assert_eq!(handle.name, "walb0");
        assert_eq!(engine.get_oldest_lsid().unwrap(), 0);
        assert_eq!(engine.get_completed_lsid().unwrap(), 0);
        assert_eq!(engine.get_log_capacity(), 10_000);
    }

    #[tokio::test]
    async fn write_then_flush_is_readable_back() {
        let (log, data) = devices();
        format_log(log.as_ref(), &geometry(), [2u8; 16], "walb0".to_string(), 0).unwrap();
        let params = StartParams::default();
        let (engine, _) = Engine::attach(log, data, &params, false).unwrap();

        let payload: Arc<[u8]> = Arc::from(vec![0xaau8; 4096]);
        engine.submit_write(100, 8, payload, true, true).await.unwrap();

        let out = engine.read(100, 8).unwrap();
        assert_eq!(out, vec![0xaau8; 4096]);
    }

    #[test]
    fn detach_then_write_is_rejected() {
        let (log, data) = devices();
        format_log(log.as_ref(), &geometry(), [3u8; 16], "walb0".to_string(), 0).unwrap();
        let params = StartParams::default();
        let (engine, _) = Engine::attach(log, data, &params, false).unwrap();
        engine.detach().unwrap();
        assert!(engine.detach().is_err());
    }

    #[test]
    fn get_version_reports_a_semver_triple() {
        assert_eq!(Engine::get_version(), (1, 0, 0));
    }
}
