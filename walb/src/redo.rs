//! Crash recovery: replay logpacks from `written_lsid` onward into the data
//! device (§4.6). Five steps per pack: read and validate the header, read
//! its payload (wrap-aware), verify each record's payload checksum,
//! apply non-padding/non-discard records to the data device, and advance.
//!
//! Stopping at the first invalid header or corrupt record makes a second
//! run over the same range a no-op: it rediscovers the same stopping point
//! and replays nothing new.

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{DeviceError, FormatError, RedoError};
use crate::format::LogpackHeader;
use crate::geometry::Geometry;
use crate::sector::SectorBuf;

/// Outcome of a single [`redo`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoResult {
    /// The lsid redo stopped at: every pack in `[start_lsid, end_lsid)` was
    /// fully applied.
    pub end_lsid: u64,
    pub packs_replayed: usize,
    pub records_replayed: usize,
}

fn read_pbs(
    log: &dyn BlockDevice,
    geometry: &Geometry,
    start_lsid: u64,
    count_pb: u64,
) -> Result<Vec<u8>, DeviceError> {
    let pbs = geometry.physical_bs as usize;
    let mut out = vec![0u8; pbs * count_pb as usize];
    let mut lsid = start_lsid;
    let mut remaining = count_pb;
    let mut written = 0usize;
    while remaining > 0 {
        let chunk = geometry.pb_until_wrap(lsid).min(remaining);
        let phys_offset = geometry.offset_of_lsid(lsid);
        let len_bytes = chunk as usize * pbs;
        log.read_at(phys_offset, &mut out[written..written + len_bytes])?;
        written += len_bytes;
        lsid += chunk;
        remaining -= chunk;
    }
    Ok(out)
}

/// Replay `[start_lsid, ..)` from `log` into `data`, stopping at the first
/// invalid or corrupt pack (or a natural end marker).
pub fn redo(
    log: &dyn BlockDevice,
    data: &dyn BlockDevice,
    geometry: &Geometry,
    salt: u32,
    start_lsid: u64,
) -> Result<RedoResult, RedoError> {
    let pbs = geometry.physical_bs as usize;
    let lb_per_pb = geometry.lb_per_pb();
    let mut lsid = start_lsid;
    let mut packs_replayed = 0usize;
    let mut records_replayed = 0usize;

    loop {
        let header_bytes = read_pbs(log, geometry, lsid, 1)?;
        let sector = SectorBuf::from_vec(header_bytes, pbs)
            .map_err(|_| RedoError::Format(FormatError::Truncated { expected: pbs, actual: 0 }))?;
        let header = match LogpackHeader::from_sector(&sector, salt) {
            Ok(h) => h,
            Err(_) => break,
        };
        if header.is_end_marker() {
            break;
        }

        let payload = read_pbs(log, geometry, lsid + 1, u64::from(header.total_io_size))?;

        let mut valid_count = 0usize;
        let mut corrupt = false;
        for (i, record) in header.records.iter().enumerate() {
            if record.is_padding() || record.is_discard() {
                valid_count = i + 1;
                continue;
            }
            let byte_off = (usize::from(record.lsid_local) - 1) * pbs;
            let len = usize::from(record.io_size) * geometry.logical_bs as usize;
            if byte_off + len > payload.len() {
                corrupt = true;
                break;
            }
            let computed = checksum::checksum(&payload[byte_off..byte_off + len], salt);
            if computed != header.record_checksums[i] {
                corrupt = true;
                break;
            }
            valid_count = i + 1;
        }

        let mut effective = header.clone();
        if corrupt {
            effective.shrink_to(valid_count, lb_per_pb);
        }

        for record in &effective.records {
            if record.is_padding() {
                continue;
            }
            if record.is_discard() {
                data.discard(record.offset, u64::from(record.io_size))?;
                records_replayed += 1;
                continue;
            }
            let byte_off = (usize::from(record.lsid_local) - 1) * pbs;
            let len = usize::from(record.io_size) * geometry.logical_bs as usize;
            data.write_at(record.offset, &payload[byte_off..byte_off + len])?;
            records_replayed += 1;
        }
        packs_replayed += 1;

        if corrupt {
            break;
        }
        lsid = header.end_lsid();
    }

    data.flush()?;
    Ok(RedoResult {
        end_lsid: lsid,
        packs_replayed,
        records_replayed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::pack::{PackBuilder, WriteDescriptor};
    use std::sync::Arc;

    fn geom() -> Geometry {
        Geometry::new(512, 4096, 0, 1000).unwrap()
    }

    fn write_pack(log: &MemDevice, geometry: &Geometry, salt: u32, lsid: u64, descs: &[WriteDescriptor]) -> u64 {
        let mut b = PackBuilder::new(lsid, salt, 64, 1000);
        for d in descs {
            b.try_add_write(d, geometry).unwrap();
        }
        let pack = b.finalize();
        let header_sector = pack.header.to_sector(geometry.physical_bs as usize, salt).unwrap();
        log.write_at(geometry.offset_of_lsid(lsid), header_sector.as_bytes()).unwrap();

        let mut payload = vec![0u8; geometry.physical_bs as usize * pack.header.total_io_size as usize];
        for (record, p) in pack.header.records.iter().zip(&pack.payloads) {
            if let Some(bytes) = p {
                let off = (usize::from(record.lsid_local) - 1) * geometry.physical_bs as usize;
                payload[off..off + bytes.len()].copy_from_slice(bytes);
            }
        }
        if !payload.is_empty() {
            log.write_at(geometry.offset_of_lsid(lsid + 1), &payload).unwrap();
        }
        write_end_marker(log, geometry, salt, pack.header.end_lsid());
        pack.header.end_lsid()
    }

    fn write_end_marker(log: &MemDevice, geometry: &Geometry, salt: u32, lsid: u64) {
        let header = LogpackHeader::end_marker(lsid);
        let sector = header.to_sector(geometry.physical_bs as usize, salt).unwrap();
        log.write_at(geometry.offset_of_lsid(lsid), sector.as_bytes()).unwrap();
    }

    #[test]
    fn replays_a_single_pack_and_stops_at_end_marker() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let data = MemDevice::new(512, 1000);
        let payload: Arc<[u8]> = Arc::from(vec![0xab; 4096]);
        let desc = WriteDescriptor {
            offset: 0,
            io_size_lb: 8,
            payload,
            flush: false,
            discard: false,
        };
        let end = write_pack(&log, &geometry, 0, 0, &[desc]);

        let result = redo(&log, &data, &geometry, 0, 0).unwrap();
        assert_eq!(result.end_lsid, end);
        assert_eq!(result.packs_replayed, 1);
        assert_eq!(result.records_replayed, 1);

        let mut out = vec![0u8; 4096];
        data.read_at(0, &mut out).unwrap();
        assert_eq!(out, vec![0xab; 4096]);
    }

    #[test]
    fn redo_is_idempotent() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let data = MemDevice::new(512, 1000);
        let payload: Arc<[u8]> = Arc::from(vec![1u8; 4096]);
        let desc = WriteDescriptor {
            offset: 0,
            io_size_lb: 8,
            payload,
            flush: false,
            discard: false,
        };
        write_pack(&log, &geometry, 0, 0, &[desc]);

        let first = redo(&log, &data, &geometry, 0, 0).unwrap();
        let second = redo(&log, &data, &geometry, 0, first.end_lsid).unwrap();
        assert_eq!(second.packs_replayed, 0);
        assert_eq!(second.end_lsid, first.end_lsid);
    }

    #[test]
    fn corrupt_record_shrinks_and_stops() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let data = MemDevice::new(512, 1000);
        let a: Arc<[u8]> = Arc::from(vec![1u8; 4096]);
        let b: Arc<[u8]> = Arc::from(vec![2u8; 4096]);
        write_pack(
            &log,
            &geometry,
            0,
            0,
            &[
                WriteDescriptor { offset: 0, io_size_lb: 8, payload: a, flush: false, discard: false },
                WriteDescriptor { offset: 8, io_size_lb: 8, payload: b, flush: false, discard: false },
            ],
        );

        // Corrupt the second record's payload in place.
        let mut corrupted = vec![0u8; 4096];
        log.read_at(geometry.offset_of_lsid(2), &mut corrupted).unwrap();
        corrupted[0] ^= 0xff;
        log.write_at(geometry.offset_of_lsid(2), &corrupted).unwrap();

        let result = redo(&log, &data, &geometry, 0, 0).unwrap();
        assert_eq!(result.end_lsid, 0);
        assert_eq!(result.records_replayed, 1);

        let mut out = vec![0u8; 4096];
        data.read_at(0, &mut out).unwrap();
        assert_eq!(out, vec![1u8; 4096]);
    }

    #[test]
    fn all_discard_pack_replays_with_no_payload_writes() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let data = MemDevice::new(512, 1000);
        let desc = WriteDescriptor {
            offset: 0,
            io_size_lb: 8,
            payload: Arc::from(vec![]),
            flush: false,
            discard: true,
        };
        write_pack(&log, &geometry, 0, 0, &[desc]);

        let result = redo(&log, &data, &geometry, 0, 0).unwrap();
        assert_eq!(result.packs_replayed, 1);
        assert_eq!(result.records_replayed, 1);
    }
}
