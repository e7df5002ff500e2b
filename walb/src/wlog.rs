//! `wlog` stream tooling: extract a range of logpacks from a log device into
//! a self-contained stream, replay such a stream into a data device, and
//! inspect a stream's logpacks without applying them (§12).
//!
//! A stream is a [`WlogStreamHeader`] sector followed by each logpack's
//! header and payload `pb`s verbatim, closed by an end marker header. It
//! carries its own salt and geometry so it can be replayed against a data
//! device independent of the log device it was extracted from.

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{DeviceError, FormatError, RedoError, WalbError};
use crate::format::{LogpackHeader, WlogStreamHeader, WLOG_STREAM_HEADER_SIZE};
use crate::geometry::Geometry;
use crate::sector::SectorBuf;

fn read_pbs(log: &dyn BlockDevice, geometry: &Geometry, start_lsid: u64, count_pb: u64) -> Result<Vec<u8>, DeviceError> {
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

/// One logpack as reported by [`inspect`]: its header plus whether every
/// record's payload checksum verified.
#[derive(Debug, Clone)]
pub struct PackSummary {
    pub logpack_lsid: u64,
    pub end_lsid: u64,
    pub n_records: usize,
    pub n_padding: u16,
    pub valid: bool,
}

/// Read `[begin_lsid, end_lsid)` from `log`, validating each logpack header
/// (but not replaying it), and return one summary per pack. Stops early,
/// without error, at the first invalid header or a natural end marker.
pub fn inspect(log: &dyn BlockDevice, geometry: &Geometry, salt: u32, begin_lsid: u64, end_lsid: u64) -> Result<Vec<PackSummary>, WalbError> {
    let pbs = geometry.physical_bs as usize;
    let mut lsid = begin_lsid;
    let mut summaries = Vec::new();

    while lsid < end_lsid {
        let header_bytes = read_pbs(log, geometry, lsid, 1)?;
        let sector = SectorBuf::from_vec(header_bytes, pbs)
            .map_err(|_| WalbError::BadFormat(FormatError::Truncated { expected: pbs, actual: 0 }))?;
        let header = match LogpackHeader::from_sector(&sector, salt) {
            Ok(h) => h,
            Err(_) => break,
        };
        if header.is_end_marker() {
            break;
        }

        let payload = read_pbs(log, geometry, lsid + 1, u64::from(header.total_io_size))?;
        let mut valid = true;
        for (i, record) in header.records.iter().enumerate() {
            if record.is_padding() || record.is_discard() {
                continue;
            }
            let byte_off = (usize::from(record.lsid_local) - 1) * pbs;
            let len = usize::from(record.io_size) * geometry.logical_bs as usize;
            if byte_off + len > payload.len() {
                valid = false;
                break;
            }
            if checksum::checksum(&payload[byte_off..byte_off + len], salt) != header.record_checksums[i] {
                valid = false;
                break;
            }
        }

        summaries.push(PackSummary {
            logpack_lsid: header.logpack_lsid,
            end_lsid: header.end_lsid(),
            n_records: header.records.len(),
            n_padding: header.n_padding,
            valid,
        });
        if !valid {
            break;
        }
        lsid = header.end_lsid();
    }
    Ok(summaries)
}

/// Extract `[begin_lsid, end_lsid)` from `log` into a stream, written
/// verbatim (header, then each logpack's header+payload `pb`s, then an end
/// marker) via `write_sector`. `write_sector` is called once per `pb` in
/// stream order, letting callers target a file, buffer, or another device.
pub fn extract(
    log: &dyn BlockDevice,
    geometry: &Geometry,
    salt: u32,
    uuid: [u8; 16],
    begin_lsid: u64,
    end_lsid: u64,
    mut write_sector: impl FnMut(&[u8]) -> Result<(), WalbError>,
) -> Result<WlogStreamHeader, WalbError> {
    let stream_header = WlogStreamHeader {
        salt,
        logical_bs: geometry.logical_bs,
        physical_bs: geometry.physical_bs,
        uuid,
        begin_lsid,
        end_lsid,
    };
    write_sector(stream_header.to_sector().as_bytes())?;

    let pbs = geometry.physical_bs as usize;
    let mut lsid = begin_lsid;
    while lsid < end_lsid {
        let header_bytes = read_pbs(log, geometry, lsid, 1)?;
        let sector = SectorBuf::from_vec(header_bytes, pbs)
            .map_err(|_| WalbError::BadFormat(FormatError::Truncated { expected: pbs, actual: 0 }))?;
        let header = LogpackHeader::from_sector(&sector, salt)?;
        if header.is_end_marker() {
            break;
        }

        write_sector(sector.as_bytes())?;
        if header.total_io_size > 0 {
            let payload = read_pbs(log, geometry, lsid + 1, u64::from(header.total_io_size))?;
            for chunk in payload.chunks_exact(pbs) {
                write_sector(chunk)?;
            }
        }
        lsid = header.end_lsid();
    }

    let end_marker = LogpackHeader::end_marker(lsid).to_sector(pbs, salt)?;
    write_sector(end_marker.as_bytes())?;
    Ok(stream_header)
}

/// Outcome of [`replay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayResult {
    pub packs_replayed: usize,
    pub records_replayed: usize,
}

/// Replay every pack from a stream produced by [`extract`] into `data`.
/// `read_sector` is called once per `pb` in stream order, starting with the
/// [`WlogStreamHeader`]; it must return exactly `physical_bs` bytes or an
/// I/O error once the stream is exhausted.
pub fn replay(
    data: &dyn BlockDevice,
    mut read_sector: impl FnMut(usize) -> Result<Vec<u8>, WalbError>,
) -> Result<ReplayResult, WalbError> {
    let header_buf = read_sector(WLOG_STREAM_HEADER_SIZE)?;
    let stream_header = WlogStreamHeader::from_sector(
        &SectorBuf::from_vec(header_buf, WLOG_STREAM_HEADER_SIZE)
            .map_err(|_| WalbError::BadFormat(FormatError::Truncated { expected: WLOG_STREAM_HEADER_SIZE, actual: 0 }))?,
    )?;
    let pbs = stream_header.physical_bs as usize;
    let salt = stream_header.salt;

    let mut packs_replayed = 0usize;
    let mut records_replayed = 0usize;

    loop {
        let header_buf = read_sector(pbs)?;
        let sector = SectorBuf::from_vec(header_buf, pbs)
            .map_err(|_| WalbError::BadFormat(FormatError::Truncated { expected: pbs, actual: 0 }))?;
        let header = LogpackHeader::from_sector(&sector, salt)
            .map_err(|e| WalbError::from(RedoError::Format(e)))?;
        if header.is_end_marker() {
            break;
        }

        let mut payload = Vec::with_capacity(pbs * header.total_io_size as usize);
        for _ in 0..header.total_io_size {
            payload.extend_from_slice(&read_sector(pbs)?);
        }

        for record in &header.records {
            if record.is_padding() {
                continue;
            }
            if record.is_discard() {
                data.discard(record.offset, u64::from(record.io_size))?;
                records_replayed += 1;
                continue;
            }
            let byte_off = (usize::from(record.lsid_local) - 1) * pbs;
            let len = usize::from(record.io_size) * stream_header.logical_bs as usize;
            data.write_at(record.offset, &payload[byte_off..byte_off + len])?;
            records_replayed += 1;
        }
        packs_replayed += 1;
    }

    data.flush()?;
    Ok(ReplayResult {
        packs_replayed,
        records_replayed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::pack::{PackBuilder, WriteDescriptor};
    use std::cell::RefCell;
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
        let end_header = LogpackHeader::end_marker(pack.header.end_lsid());
        let end_sector = end_header.to_sector(geometry.physical_bs as usize, salt).unwrap();
        log.write_at(geometry.offset_of_lsid(pack.header.end_lsid()), end_sector.as_bytes()).unwrap();
        pack.header.end_lsid()
    }

    #[test]
    fn inspect_reports_one_valid_pack() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let payload: Arc<[u8]> = Arc::from(vec![0xcd; 4096]);
        let desc = WriteDescriptor {
            offset: 0,
            io_size_lb: 8,
            payload,
            flush: false,
            discard: false,
        };
        let end = write_pack(&log, &geometry, 7, 0, &[desc]);

        let summaries = inspect(&log, &geometry, 7, 0, end).unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].valid);
        assert_eq!(summaries[0].end_lsid, end);
    }

    #[test]
    fn extract_then_replay_round_trips_a_pack() {
        let geometry = geom();
        let log = MemDevice::new(4096, 1000);
        let data = MemDevice::new(512, 1000);
        let payload: Arc<[u8]> = Arc::from(vec![0x42; 4096]);
        let desc = WriteDescriptor {
            offset: 5,
            io_size_lb: 8,
            payload,
            flush: false,
            discard: false,
        };
        let end = write_pack(&log, &geometry, 3, 0, &[desc]);

        let stream: RefCell<Vec<u8>> = RefCell::new(Vec::new());
        extract(&log, &geometry, 3, [9u8; 16], 0, end, |bytes| {
            stream.borrow_mut().extend_from_slice(bytes);
            Ok(())
        })
        .unwrap();

        let stream_bytes = stream.into_inner();
        let cursor = RefCell::new(0usize);
        let result = replay(&data, |len| {
            let mut pos = cursor.borrow_mut();
            let chunk = stream_bytes[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(chunk)
        })
        .unwrap();

        assert_eq!(result.packs_replayed, 1);
        assert_eq!(result.records_replayed, 1);

        let mut out = vec![0u8; 4096];
        data.read_at(5, &mut out).unwrap();
        assert_eq!(out, vec![0x42; 4096]);
    }
}
