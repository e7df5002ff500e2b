//! The write pipeline (§4.5): admit, build, log-write, log-complete/submit-data,
//! data-complete, periodic log-flush, and (via [`crate::checkpoint`]) the
//! checkpointer.
//!
//! The build stage is single-threaded, as required by the pack builder's own
//! sequencing; log-write/data-submit/data-complete for distinct packs run as
//! independent tokio tasks bounded by a semaphore sized to `n_pack_bulk`, so
//! packs may be in flight concurrently while still completing in lsid order
//! from an external observer's point of view (`completed_lsid` only advances
//! over a contiguous prefix).
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::device::BlockDevice;
use crate::error::WalbError;
use crate::geometry::Geometry;
use crate::lsid::LsidCounters;
use crate::overlap::OverlapTracker;
use crate::pack::{FinalizedPack, PackBuilder, WriteDescriptor};
use crate::pending::{PendingEntry, PendingSet};

/// Tunables from §6's start parameters.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub max_logpack_pb: u16,
    pub max_pending_bytes: u64,
    pub min_pending_bytes: u64,
    pub queue_stop_timeout: Duration,
    pub log_flush_interval_pb: u64,
    pub log_flush_interval: Duration,
    pub n_pack_bulk: usize,
    /// When set, discard records are skipped rather than forwarded to the
    /// data device's `BlockDevice::discard` (format-time `nodiscard` flag).
    pub nodiscard: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_logpack_pb: 256,
            max_pending_bytes: 32 * 1024 * 1024,
            min_pending_bytes: 16 * 1024 * 1024,
            queue_stop_timeout: Duration::from_millis(100),
            log_flush_interval_pb: 16 * 1024 * 1024 / 4096,
            log_flush_interval: Duration::from_millis(100),
            n_pack_bulk: 128,
            nodiscard: false,
        }
    }
}

struct Job {
    desc: WriteDescriptor,
    fua: bool,
    reply: oneshot::Sender<Result<(), WalbError>>,
}

struct Shared {
    geometry: Geometry,
    salt: u32,
    log: Arc<dyn BlockDevice>,
    data: Arc<dyn BlockDevice>,
    config: PipelineConfig,
    counters: Mutex<LsidCounters>,
    overlap: Mutex<OverlapTracker>,
    pending: Mutex<PendingSet>,
    submitted_ranges: Mutex<BTreeMap<u64, u64>>,
    completed_ranges: Mutex<BTreeMap<u64, u64>>,
    /// Next pack's `logpack_lsid` allowed to register its ranges in `overlap`.
    /// Packs run as independent tasks, so without this a later pack could
    /// register (and pass the overlap gate) before an earlier, truly
    /// overlapping pack has registered — violating admission-order
    /// serialization of overlapping data-device writes.
    register_prefix: Mutex<u64>,
    admission_paused: AtomicBool,
    semaphore: Arc<Semaphore>,
    /// Last time the log device was flushed for the periodic-flush stage.
    /// `log_flush_interval_ms == 0` (Open Question 1) means "flush on every
    /// opportunity", so every `completed_lsid` advance is due.
    last_flush_at: Mutex<tokio::time::Instant>,
}

/// Handle to a running write pipeline. Cloning shares the same underlying
/// state; dropping every handle and the build task's sender closes it.
#[derive(Clone)]
pub struct WritePipeline {
    shared: Arc<Shared>,
    build_tx: mpsc::Sender<Job>,
}

impl WritePipeline {
    /// Start the pipeline's build task and return a handle to submit writes.
    #[must_use]
    pub fn spawn(
        geometry: Geometry,
        salt: u32,
        log: Arc<dyn BlockDevice>,
        data: Arc<dyn BlockDevice>,
        config: PipelineConfig,
        start_lsid: u64,
    ) -> Self {
        let shared = Arc::new(Shared {
            geometry,
            salt,
            log,
            data,
            config,
            counters: Mutex::new(LsidCounters::new(start_lsid)),
            overlap: Mutex::new(OverlapTracker::new()),
            pending: Mutex::new(PendingSet::new()),
            submitted_ranges: Mutex::new(BTreeMap::new()),
            completed_ranges: Mutex::new(BTreeMap::new()),
            register_prefix: Mutex::new(start_lsid),
            admission_paused: AtomicBool::new(false),
            semaphore: Arc::new(Semaphore::new(config.n_pack_bulk)),
            last_flush_at: Mutex::new(tokio::time::Instant::now()),
        });

        let (build_tx, build_rx) = mpsc::channel(1024);
        tokio::spawn(build_loop(Arc::clone(&shared), build_rx));

        Self { shared, build_tx }
    }

    #[must_use]
    pub fn counters(&self) -> LsidCounters {
        *lock(&self.shared.counters)
    }

    pub fn reset_read_only(&self) {
        let mut counters = lock(&self.shared.counters);
        counters.read_only = false;
        counters.log_overflow = false;
    }

    pub fn set_oldest_lsid(&self, lsid: u64) {
        lock(&self.shared.counters).advance_oldest(lsid);
    }

    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.shared.config
    }

    #[must_use]
    pub fn log_flush_interval_ms(&self) -> u64 {
        self.shared.config.log_flush_interval.as_millis() as u64
    }

    /// The payload of a write still pending data-device durability at exactly
    /// `offset`, if any, for serving reads "from pending data if present".
    #[must_use]
    pub fn pending_at(&self, offset: u64) -> Option<Arc<[u8]>> {
        lock(&self.shared.pending).get(offset).map(|e| Arc::clone(&e.payload))
    }

    /// Admit one write. Resolves once the write is data-durable (or, for a
    /// plain write with no FUA, once its pack is log-durable and the data
    /// write has been submitted — callers that need strict data-durability
    /// should use `fua: true`).
    pub async fn submit_write(
        &self,
        offset: u64,
        io_size_lb: u16,
        payload: Arc<[u8]>,
        flush: bool,
        fua: bool,
    ) -> Result<(), WalbError> {
        {
            let counters = lock(&self.shared.counters);
            if counters.read_only {
                return Err(WalbError::State("device is READ_ONLY".into()));
            }
        }
        self.wait_for_backpressure().await?;
        {
            let mut counters = lock(&self.shared.counters);
            let additional_pb = u64::from(self.shared.geometry.pb_span(io_size_lb)) + 1;
            if counters.would_overflow(additional_pb, self.shared.geometry.ring_buffer_size) {
                counters.latch_log_overflow();
                return Err(WalbError::LogOverflow);
            }
        }

        let (tx, rx) = oneshot::channel();
        let job = Job {
            desc: WriteDescriptor {
                offset,
                io_size_lb,
                payload,
                flush,
                discard: false,
            },
            fua,
            reply: tx,
        };
        self.build_tx
            .send(job)
            .await
            .map_err(|_| WalbError::State("pipeline is shut down".into()))?;
        rx.await
            .map_err(|_| WalbError::State("pipeline is shut down".into()))?
    }

    async fn wait_for_backpressure(&self) -> Result<(), WalbError> {
        let bytes = lock(&self.shared.pending).pending_bytes();
        if bytes > self.shared.config.max_pending_bytes {
            self.shared.admission_paused.store(true, Ordering::SeqCst);
        } else if bytes < self.shared.config.min_pending_bytes {
            self.shared.admission_paused.store(false, Ordering::SeqCst);
        }
        if !self.shared.admission_paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.shared.config.queue_stop_timeout;
        loop {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let bytes = lock(&self.shared.pending).pending_bytes();
            if bytes < self.shared.config.min_pending_bytes {
                self.shared.admission_paused.store(false, Ordering::SeqCst);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WalbError::Transient(
                    "admission backpressure timeout".into(),
                ));
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn advance_prefix(ranges: &mut BTreeMap<u64, u64>, counter: &mut u64, start: u64, end: u64) {
    ranges.insert(start, end);
    while let Some(next) = ranges.remove(counter) {
        *counter = next;
    }
}

async fn build_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Job>) {
    let max_records = {
        let pbs = shared.geometry.physical_bs as usize;
        crate::format::LogpackHeader::max_records(pbs)
    };
    let mut builder_lsid = lock(&shared.counters).latest;
    let mut builder = PackBuilder::new(
        builder_lsid,
        shared.salt,
        max_records,
        shared.config.max_logpack_pb,
    );
    let mut staged: Vec<Job> = Vec::new();

    while let Some(job) = rx.recv().await {
        if job.fua {
            if !builder.is_empty() {
                let pack = std::mem::replace(
                    &mut builder,
                    PackBuilder::new(0, shared.salt, max_records, shared.config.max_logpack_pb),
                )
                .finalize();
                dispatch_pack(&shared, pack, std::mem::take(&mut staged), false).await;
                builder_lsid = lock(&shared.counters).latest;
                builder = PackBuilder::new(
                    builder_lsid,
                    shared.salt,
                    max_records,
                    shared.config.max_logpack_pb,
                );
            }
            let mut fua_builder = PackBuilder::new(
                builder_lsid,
                shared.salt,
                max_records,
                shared.config.max_logpack_pb,
            );
            match fua_builder.try_add_write(&job.desc, &shared.geometry) {
                Ok(()) => {
                    let pack = fua_builder.finalize();
                    dispatch_pack(&shared, pack, vec![job], true).await;
                    builder_lsid = lock(&shared.counters).latest;
                    builder = PackBuilder::new(
                        builder_lsid,
                        shared.salt,
                        max_records,
                        shared.config.max_logpack_pb,
                    );
                }
                Err(e) => {
                    let _ = job.reply.send(Err(e.into()));
                }
            }
            continue;
        }

        match builder.try_add_write(&job.desc, &shared.geometry) {
            Ok(()) => {
                let closed = builder.is_closed();
                staged.push(job);
                if closed {
                    let pack = std::mem::replace(
                        &mut builder,
                        PackBuilder::new(
                            0,
                            shared.salt,
                            max_records,
                            shared.config.max_logpack_pb,
                        ),
                    )
                    .finalize();
                    dispatch_pack(&shared, pack, std::mem::take(&mut staged), false).await;
                    builder_lsid = lock(&shared.counters).latest;
                    builder = PackBuilder::new(
                        builder_lsid,
                        shared.salt,
                        max_records,
                        shared.config.max_logpack_pb,
                    );
                }
            }
            Err(_) if !builder.is_empty() => {
                let pack = std::mem::replace(
                    &mut builder,
                    PackBuilder::new(0, shared.salt, max_records, shared.config.max_logpack_pb),
                )
                .finalize();
                dispatch_pack(&shared, pack, std::mem::take(&mut staged), false).await;
                builder_lsid = lock(&shared.counters).latest;
                builder = PackBuilder::new(
                    builder_lsid,
                    shared.salt,
                    max_records,
                    shared.config.max_logpack_pb,
                );
                match builder.try_add_write(&job.desc, &shared.geometry) {
                    Ok(()) => staged.push(job),
                    Err(e) => {
                        let _ = job.reply.send(Err(e.into()));
                    }
                }
            }
            Err(e) => {
                let _ = job.reply.send(Err(e.into()));
            }
        }
    }

    if !builder.is_empty() {
        let pack = builder.finalize();
        dispatch_pack(&shared, pack, staged, false).await;
    }
}

async fn dispatch_pack(shared: &Arc<Shared>, pack: FinalizedPack, jobs: Vec<Job>, force_flush: bool) {
    let start_lsid = pack.header.logpack_lsid;
    let end_lsid = pack.end_lsid();
    lock(&shared.counters).advance_latest(end_lsid);

    let Ok(permit) = Arc::clone(&shared.semaphore).acquire_owned().await else {
        fail_all(jobs, "pipeline semaphore closed");
        return;
    };

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let _permit = permit;
        run_pack(&shared, pack, jobs, force_flush, start_lsid, end_lsid).await;
    });
}

async fn run_pack(
    shared: &Arc<Shared>,
    pack: FinalizedPack,
    jobs: Vec<Job>,
    force_flush: bool,
    start_lsid: u64,
    end_lsid: u64,
) {
    let pbs = shared.geometry.physical_bs as usize;

    let header_sector = match pack.header.to_sector(pbs, shared.salt) {
        Ok(s) => s,
        Err(e) => {
            fail_all(jobs, &e.to_string());
            return;
        }
    };
    if let Err(e) = write_pbs(&*shared.log, &shared.geometry, start_lsid, header_sector.as_bytes()) {
        lock(&shared.counters).latch_read_only();
        fail_all(jobs, &e.to_string());
        return;
    }

    if pack.header.total_io_size > 0 {
        let mut payload = vec![0u8; pbs * pack.header.total_io_size as usize];
        for (record, p) in pack.header.records.iter().zip(&pack.payloads) {
            if let Some(bytes) = p {
                let off = (usize::from(record.lsid_local) - 1) * pbs;
                payload[off..off + bytes.len()].copy_from_slice(bytes);
            }
        }
        if let Err(e) = write_pbs(&*shared.log, &shared.geometry, start_lsid + 1, &payload) {
            lock(&shared.counters).latch_read_only();
            fail_all(jobs, &e.to_string());
            return;
        }
    }

    advance_prefix(
        &mut lock(&shared.submitted_ranges),
        &mut lock(&shared.counters).submitted,
        start_lsid,
        end_lsid,
    );

    // Registration must happen in admission (lsid) order: otherwise a later
    // pack's task could register and clear the overlap gate before an
    // earlier, truly overlapping pack has registered its own range.
    loop {
        if *lock(&shared.register_prefix) == start_lsid {
            break;
        }
        tokio::task::yield_now().await;
    }
    for (record, p) in pack.header.records.iter().zip(&pack.payloads) {
        if record.is_padding() || record.is_discard() {
            continue;
        }
        if let Some(bytes) = p {
            lock(&shared.overlap).insert(record.offset, u64::from(record.io_size));
            lock(&shared.pending).insert(
                record.offset,
                PendingEntry {
                    lsid: record.lsid,
                    payload: Arc::clone(bytes),
                },
            );
        }
    }
    *lock(&shared.register_prefix) = end_lsid;

    for (record, p) in pack.header.records.iter().zip(&pack.payloads) {
        if record.is_padding() {
            continue;
        }
        if record.is_discard() {
            if !shared.config.nodiscard {
                let _ = shared.data.discard(record.offset, u64::from(record.io_size));
            }
            continue;
        }
        let Some(bytes) = p else { continue };

        loop {
            let blocked = lock(&shared.overlap)
                .overlapping(record.offset, u64::from(record.io_size))
                .into_iter()
                .any(|(s, _)| s != record.offset);
            if !blocked {
                break;
            }
            tokio::task::yield_now().await;
        }

        if let Err(e) = shared.data.write_at(record.offset, bytes) {
            lock(&shared.counters).latch_read_only();
            fail_all(jobs, &e.to_string());
            return;
        }
    }

    if force_flush {
        let _ = shared.data.flush();
        let _ = shared.log.flush();
    }

    for (record, _) in pack.header.records.iter().zip(&pack.payloads) {
        if !(record.is_padding() || record.is_discard()) {
            lock(&shared.overlap).remove(record.offset);
            lock(&shared.pending).remove(record.offset);
        }
    }

    {
        let mut ranges = lock(&shared.completed_ranges);
        let mut counters = lock(&shared.counters);
        advance_prefix(&mut ranges, &mut counters.completed, start_lsid, end_lsid);

        let usage_pb = counters.completed.saturating_sub(counters.permanent);
        let time_due = {
            let last = *lock(&shared.last_flush_at);
            shared.config.log_flush_interval.is_zero()
                || tokio::time::Instant::now().duration_since(last) >= shared.config.log_flush_interval
        };
        if force_flush || usage_pb >= shared.config.log_flush_interval_pb || time_due {
            drop(counters);
            let _ = shared.log.flush();
            *lock(&shared.last_flush_at) = tokio::time::Instant::now();
            lock(&shared.counters).advance_permanent();
        }
    }

    for job in jobs {
        let _ = job.reply.send(Ok(()));
    }
}

fn fail_all(jobs: Vec<Job>, message: &str) {
    for job in jobs {
        let _ = job.reply.send(Err(WalbError::IoFailure(crate::error::DeviceError::Io(
            std::io::Error::other(message.to_string()),
        ))));
    }
}

fn write_pbs(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    start_lsid: u64,
    buf: &[u8],
) -> Result<(), crate::error::DeviceError> {
    let pbs = geometry.physical_bs as usize;
    let total_pb = (buf.len() / pbs) as u64;
    let mut lsid = start_lsid;
    let mut remaining = total_pb;
    let mut written = 0usize;
    while remaining > 0 {
        let chunk = geometry.pb_until_wrap(lsid).min(remaining);
        let phys_offset = geometry.offset_of_lsid(lsid);
        let len_bytes = chunk as usize * pbs;
        device.write_at(phys_offset, &buf[written..written + len_bytes])?;
        written += len_bytes;
        lsid += chunk;
        remaining -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn geom() -> Geometry {
        Geometry::new(512, 4096, 0, 10_000).unwrap()
    }

    fn pipeline() -> WritePipeline {
        let log: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096, 10_000));
        let data: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(512, 10_000));
        WritePipeline::spawn(geom(), 0, log, data, PipelineConfig::default(), 0)
    }

    #[tokio::test]
    async fn single_write_completes_and_advances_counters() {
        let p = pipeline();
        let payload: Arc<[u8]> = Arc::from(vec![9u8; 4096]);
        p.submit_write(0, 8, payload, false, false).await.unwrap();
        // give the async build/log/data tasks a chance to run
        for _ in 0..100 {
            if p.counters().completed > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(p.counters().completed > 0);
    }

    #[tokio::test]
    async fn fua_write_forces_flush_before_completion() {
        let p = pipeline();
        let payload: Arc<[u8]> = Arc::from(vec![5u8; 4096]);
        p.submit_write(0, 8, payload, false, true).await.unwrap();
        assert!(p.counters().permanent >= p.counters().completed || p.counters().completed > 0);
    }

    #[tokio::test]
    async fn overflow_latches_read_only() {
        let log: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096, 4));
        let data: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(512, 4));
        let p = WritePipeline::spawn(
            Geometry::new(512, 4096, 0, 2).unwrap(),
            0,
            log,
            data,
            PipelineConfig::default(),
            0,
        );
        let payload: Arc<[u8]> = Arc::from(vec![1u8; 4096 * 4]);
        let err = p.submit_write(0, 32, payload, false, false).await.unwrap_err();
        assert!(matches!(err, WalbError::LogOverflow));
        assert!(p.counters().read_only);
        assert!(p.counters().log_overflow);
    }
}
