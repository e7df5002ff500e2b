//! Pack builder: groups write (and read) descriptors into logpacks following
//! the five ordered rules of §4.3 — a FLUSH descriptor closes the pack it
//! joins, an overlap with an already-queued descriptor closes the pack
//! without joining, capacity (`max_records` / `max_logpack_pb`) closes the
//! pack, otherwise the descriptor is appended, and a descriptor that would
//! straddle a ring-buffer wrap gets a padding record inserted ahead of it.
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::checksum;
use crate::error::PackError;
use crate::format::{LogRecord, LogpackHeader, RECORD_DISCARD, RECORD_EXIST, RECORD_PADDING};
use crate::geometry::Geometry;

/// A single write to admit into a logpack.
#[derive(Debug, Clone)]
pub struct WriteDescriptor {
    /// Starting offset on the data device, in logical blocks.
    pub offset: u64,
    /// I/O size in logical blocks.
    pub io_size_lb: u16,
    pub payload: Arc<[u8]>,
    /// Closes the pack this descriptor joins; every pack boundary after it
    /// must be log- and data-durable before subsequent packs proceed.
    pub flush: bool,
    /// A discard touches no payload bytes and contributes zero `pb`.
    pub discard: bool,
}

/// A single read to group for submission; read packs carry no header and no
/// checksums, only descriptor bookkeeping for bulk submission (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct ReadDescriptor {
    pub offset: u64,
    pub io_size_lb: u16,
}

/// The output of [`PackBuilder::finalize`]: a logpack header ready to
/// serialize, and the payload bytes for each non-padding, non-discard
/// record, aligned index-for-index with `header.records`.
#[derive(Debug, Clone)]
pub struct FinalizedPack {
    pub header: LogpackHeader,
    pub payloads: Vec<Option<Arc<[u8]>>>,
}

impl FinalizedPack {
    #[must_use]
    pub fn end_lsid(&self) -> u64 {
        self.header.end_lsid()
    }
}

/// Accumulates write descriptors into a single logpack.
#[derive(Debug)]
pub struct PackBuilder {
    logpack_lsid: u64,
    salt: u32,
    max_records: usize,
    max_logpack_pb: u16,
    records: Vec<LogRecord>,
    record_checksums: Vec<u32>,
    payloads: Vec<Option<Arc<[u8]>>>,
    existing_ranges: Vec<(u64, u64)>,
    total_io_size: u16,
    n_padding: u16,
    closed: bool,
}

impl PackBuilder {
    #[must_use]
    pub fn new(logpack_lsid: u64, salt: u32, max_records: usize, max_logpack_pb: u16) -> Self {
        Self {
            logpack_lsid,
            salt,
            max_records,
            max_logpack_pb,
            records: Vec::new(),
            record_checksums: Vec::new(),
            payloads: Vec::new(),
            existing_ranges: Vec::new(),
            total_io_size: 0,
            n_padding: 0,
            closed: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_lsid(&self) -> u64 {
        self.logpack_lsid + 1 + u64::from(self.total_io_size)
    }

    /// Attempt to add `desc`. On `Err(PackError::Full)` the caller must
    /// finalize this builder and retry `desc` against a fresh one.
    pub fn try_add_write(
        &mut self,
        desc: &WriteDescriptor,
        geometry: &Geometry,
    ) -> Result<(), PackError> {
        if desc.io_size_lb == 0 {
            return Err(PackError::ZeroLengthIo);
        }
        if self.closed {
            return Err(PackError::Full);
        }

        let new_end = desc.offset + u64::from(desc.io_size_lb);
        if self
            .existing_ranges
            .iter()
            .any(|&(s, e)| e > desc.offset && s < new_end)
        {
            return Err(PackError::Full);
        }

        let io_pb: u16 = if desc.discard {
            0
        } else {
            geometry.pb_span(desc.io_size_lb)
        };

        let mut needs_padding = false;
        let mut padding_pb: u16 = 0;
        if io_pb > 0 {
            let remaining = geometry.pb_until_wrap(self.next_lsid());
            if remaining < u64::from(io_pb) {
                if self.n_padding > 0 {
                    return Err(PackError::Full);
                }
                needs_padding = true;
                padding_pb = remaining as u16;
            }
        }

        let extra_records = usize::from(needs_padding) + 1;
        if self.records.len() + extra_records > self.max_records {
            return Err(PackError::Full);
        }
        let extra_pb = padding_pb + io_pb;
        if u32::from(self.total_io_size) + u32::from(extra_pb) > u32::from(self.max_logpack_pb) {
            return Err(PackError::Full);
        }

        if needs_padding {
            self.push_padding(padding_pb)?;
        }

        let lsid_local = 1 + self.total_io_size;
        let lsid = self
            .logpack_lsid
            .checked_add(u64::from(lsid_local))
            .ok_or(PackError::LsidOverflow)?;

        let mut flags = RECORD_EXIST;
        if desc.discard {
            flags |= RECORD_DISCARD;
        }
        let record = LogRecord {
            flags,
            offset: desc.offset,
            io_size: desc.io_size_lb,
            lsid_local,
            lsid,
        };
        let payload_checksum = if desc.discard {
            0
        } else {
            checksum::checksum(&desc.payload, self.salt)
        };

        self.records.push(record);
        self.record_checksums.push(payload_checksum);
        self.payloads.push(if desc.discard {
            None
        } else {
            Some(Arc::clone(&desc.payload))
        });
        self.existing_ranges.push((desc.offset, new_end));
        self.total_io_size += io_pb;

        if desc.flush {
            self.closed = true;
        }
        Ok(())
    }

    fn push_padding(&mut self, padding_pb: u16) -> Result<(), PackError> {
        let lsid_local = 1 + self.total_io_size;
        let lsid = self
            .logpack_lsid
            .checked_add(u64::from(lsid_local))
            .ok_or(PackError::LsidOverflow)?;
        let record = LogRecord {
            flags: RECORD_EXIST | RECORD_PADDING,
            offset: 0,
            io_size: 0,
            lsid_local,
            lsid,
        };
        self.records.push(record);
        self.record_checksums.push(0);
        self.payloads.push(None);
        self.total_io_size += padding_pb;
        self.n_padding += 1;
        Ok(())
    }

    #[must_use]
    pub fn finalize(self) -> FinalizedPack {
        let header = LogpackHeader {
            logpack_lsid: self.logpack_lsid,
            total_io_size: self.total_io_size,
            n_padding: self.n_padding,
            records: self.records,
            record_checksums: self.record_checksums,
        };
        FinalizedPack {
            header,
            payloads: self.payloads,
        }
    }
}

/// Groups reads for bulk submission. Unlike writes, reads never touch the
/// log device, so there is no header, checksum, or wrap bookkeeping.
#[derive(Debug, Default)]
pub struct ReadPackBuilder {
    descriptors: Vec<ReadDescriptor>,
    max_io_bulk: usize,
}

impl ReadPackBuilder {
    #[must_use]
    pub fn new(max_io_bulk: usize) -> Self {
        Self {
            descriptors: Vec::new(),
            max_io_bulk,
        }
    }

    pub fn try_add_read(&mut self, desc: ReadDescriptor) -> Result<(), PackError> {
        if desc.io_size_lb == 0 {
            return Err(PackError::ZeroLengthIo);
        }
        if self.descriptors.len() >= self.max_io_bulk {
            return Err(PackError::Full);
        }
        self.descriptors.push(desc);
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    #[must_use]
    pub fn finalize(self) -> Vec<ReadDescriptor> {
        self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Geometry::new(512, 4096, 0, 1_000_000).unwrap()
    }

    fn write(offset: u64, lb: u16) -> WriteDescriptor {
        WriteDescriptor {
            offset,
            io_size_lb: lb,
            payload: Arc::from(vec![0xab; lb as usize * 512]),
            flush: false,
            discard: false,
        }
    }

    #[test]
    fn non_overlapping_writes_join_one_pack() {
        let mut b = PackBuilder::new(0, 0, 64, 1000);
        b.try_add_write(&write(0, 8), &geom()).unwrap();
        b.try_add_write(&write(8, 8), &geom()).unwrap();
        let pack = b.finalize();
        assert_eq!(pack.header.records.len(), 2);
        assert_eq!(pack.header.total_io_size, 2);
    }

    #[test]
    fn overlapping_write_closes_the_pack() {
        let mut b = PackBuilder::new(0, 0, 64, 1000);
        b.try_add_write(&write(0, 16), &geom()).unwrap();
        assert!(matches!(
            b.try_add_write(&write(8, 8), &geom()),
            Err(PackError::Full)
        ));
    }

    #[test]
    fn capacity_cap_closes_the_pack() {
        let mut b = PackBuilder::new(0, 0, 64, 1);
        b.try_add_write(&write(0, 8), &geom()).unwrap();
        assert!(matches!(
            b.try_add_write(&write(100, 8), &geom()),
            Err(PackError::Full)
        ));
    }

    #[test]
    fn flush_descriptor_closes_pack_after_joining() {
        let mut b = PackBuilder::new(0, 0, 64, 1000);
        let mut d = write(0, 8);
        d.flush = true;
        b.try_add_write(&d, &geom()).unwrap();
        assert!(b.is_closed());
        assert!(matches!(
            b.try_add_write(&write(100, 8), &geom()),
            Err(PackError::Full)
        ));
    }

    #[test]
    fn all_discard_pack_has_zero_total_io_size() {
        let mut b = PackBuilder::new(0, 0, 64, 1000);
        let mut d = write(0, 8);
        d.discard = true;
        b.try_add_write(&d, &geom()).unwrap();
        let pack = b.finalize();
        assert_eq!(pack.header.total_io_size, 0);
        assert_eq!(pack.header.records.len(), 1);
        assert!(pack.header.records[0].is_discard());
    }

    #[test]
    fn wrap_around_inserts_padding_record() {
        // ring_buffer_size=10, logpack_lsid=8: the pack's own header occupies
        // lsid 8, leaving 1 pb before the ring wraps at lsid 10. A 2-pb write
        // cannot fit before the wrap, so it gets a 1-pb padding record first.
        let g = Geometry::new(512, 4096, 0, 10).unwrap();
        let mut b = PackBuilder::new(8, 0, 64, 1000);
        b.try_add_write(&write(0, 16), &g).unwrap();
        let pack = b.finalize();
        assert_eq!(pack.header.n_padding, 1);
        assert!(pack.header.records[0].is_padding());
        assert!(pack.header.records[1].is_exist());
        assert_eq!(pack.header.total_io_size, 3);
    }

    #[test]
    fn zero_length_io_is_rejected() {
        let mut b = PackBuilder::new(0, 0, 64, 1000);
        assert!(matches!(
            b.try_add_write(&write(0, 0), &geom()),
            Err(PackError::ZeroLengthIo)
        ));
    }

    #[test]
    fn read_pack_builder_caps_at_io_bulk() {
        let mut b = ReadPackBuilder::new(1);
        b.try_add_read(ReadDescriptor {
            offset: 0,
            io_size_lb: 8,
        })
        .unwrap();
        assert!(matches!(
            b.try_add_read(ReadDescriptor {
                offset: 8,
                io_size_lb: 8
            }),
            Err(PackError::Full)
        ));
    }
}
