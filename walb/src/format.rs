//! On-disk structures: super sector, logpack header, log record, wlog stream header.
//!
//! Every field's offset and width is fixed here explicitly rather than via
//! struct layout, so the format is independent of target alignment rules.
#![allow(clippy::cast_possible_truncation)]

use crate::checksum;
use crate::error::FormatError;
use crate::sector::SectorBuf;

pub const SECTOR_TYPE_SUPER: u16 = 1;
pub const SECTOR_TYPE_LOGPACK: u16 = 2;
pub const SUPER_SECTOR_VERSION: u32 = 1;

pub const RECORD_EXIST: u32 = 1 << 0;
pub const RECORD_PADDING: u32 = 1 << 1;
pub const RECORD_DISCARD: u32 = 1 << 2;

pub const LOGPACK_HEADER_FIXED_SIZE: usize = 24;
pub const LOG_RECORD_SIZE: usize = 32;

pub const WLOG_MAGIC: [u8; 4] = *b"WLOG";
pub const WLOG_HEADER_VERSION: u32 = 1;

mod super_offsets {
    pub const CHECKSUM: usize = 0;
    pub const SECTOR_TYPE: usize = 4;
    pub const VERSION: usize = 6;
    pub const LOGICAL_BS: usize = 10;
    pub const PHYSICAL_BS: usize = 14;
    pub const SNAPSHOT_METADATA_SIZE: usize = 18;
    pub const UUID: usize = 22;
    pub const NAME: usize = 38;
    pub const NAME_LEN: usize = 32;
    pub const LOG_CHECKSUM_SALT: usize = 70;
    pub const RING_BUFFER_SIZE: usize = 74;
    pub const OLDEST_LSID: usize = 82;
    pub const WRITTEN_LSID: usize = 90;
}

mod header_offsets {
    pub const CHECKSUM: usize = 0;
    pub const SECTOR_TYPE: usize = 4;
    pub const TOTAL_IO_SIZE: usize = 6;
    pub const LOGPACK_LSID: usize = 8;
    pub const N_RECORDS: usize = 16;
    pub const N_PADDING: usize = 18;
    pub const RECORDS: usize = 24;
}

mod record_offsets {
    pub const CHECKSUM: usize = 0;
    pub const FLAGS: usize = 4;
    pub const OFFSET: usize = 8;
    pub const IO_SIZE: usize = 16;
    pub const LSID_LOCAL: usize = 18;
    pub const LSID: usize = 24;
}

/// The super sector: device geometry, uuid, name, and the durability
/// watermarks `oldest_lsid`/`written_lsid`. Written twice (primary and
/// secondary copy); both independently verify against salt `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperSector {
    pub logical_bs: u32,
    pub physical_bs: u32,
    pub snapshot_metadata_size: u32,
    pub uuid: [u8; 16],
    pub name: String,
    pub log_checksum_salt: u32,
    pub ring_buffer_size: u64,
    pub oldest_lsid: u64,
    pub written_lsid: u64,
}

impl SuperSector {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logical_bs: u32,
        physical_bs: u32,
        snapshot_metadata_size: u32,
        uuid: [u8; 16],
        name: String,
        log_checksum_salt: u32,
        ring_buffer_size: u64,
    ) -> Self {
        Self {
            logical_bs,
            physical_bs,
            snapshot_metadata_size,
            uuid,
            name,
            log_checksum_salt,
            ring_buffer_size,
            oldest_lsid: 0,
            written_lsid: 0,
        }
    }

    pub fn to_sector(&self) -> Result<SectorBuf, FormatError> {
        if self.name.len() > super_offsets::NAME_LEN - 1 {
            return Err(FormatError::NameTooLong(self.name.len()));
        }
        let mut sector = SectorBuf::zeroed(self.physical_bs as usize);

        sector.write_u16(super_offsets::SECTOR_TYPE, SECTOR_TYPE_SUPER);
        sector.write_u32(super_offsets::VERSION, SUPER_SECTOR_VERSION);
        sector.write_u32(super_offsets::LOGICAL_BS, self.logical_bs);
        sector.write_u32(super_offsets::PHYSICAL_BS, self.physical_bs);
        sector.write_u32(
            super_offsets::SNAPSHOT_METADATA_SIZE,
            self.snapshot_metadata_size,
        );
        sector.write_bytes(super_offsets::UUID, &self.uuid);

        let mut name_buf = [0u8; super_offsets::NAME_LEN];
        let name_bytes = self.name.as_bytes();
        name_buf[..name_bytes.len()].copy_from_slice(name_bytes);
        sector.write_bytes(super_offsets::NAME, &name_buf);

        sector.write_u32(super_offsets::LOG_CHECKSUM_SALT, self.log_checksum_salt);
        sector.write_u64(super_offsets::RING_BUFFER_SIZE, self.ring_buffer_size);
        sector.write_u64(super_offsets::OLDEST_LSID, self.oldest_lsid);
        sector.write_u64(super_offsets::WRITTEN_LSID, self.written_lsid);

        checksum::stamp(sector.as_bytes_mut(), super_offsets::CHECKSUM, 0);
        Ok(sector)
    }

    pub fn from_sector(sector: &SectorBuf) -> Result<Self, FormatError> {
        if !checksum::verify(sector.as_bytes(), 0) {
            return Err(FormatError::Checksum);
        }
        let sector_type = sector.read_u16(super_offsets::SECTOR_TYPE);
        if sector_type != SECTOR_TYPE_SUPER {
            return Err(FormatError::BadSectorType(sector_type));
        }
        let version = sector.read_u32(super_offsets::VERSION);
        if version != SUPER_SECTOR_VERSION {
            return Err(FormatError::BadVersion(version));
        }

        let name_bytes = sector.read_bytes(super_offsets::NAME, super_offsets::NAME_LEN);
        let nul = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(sector.read_bytes(super_offsets::UUID, 16));

        Ok(Self {
            logical_bs: sector.read_u32(super_offsets::LOGICAL_BS),
            physical_bs: sector.read_u32(super_offsets::PHYSICAL_BS),
            snapshot_metadata_size: sector.read_u32(super_offsets::SNAPSHOT_METADATA_SIZE),
            uuid,
            name,
            log_checksum_salt: sector.read_u32(super_offsets::LOG_CHECKSUM_SALT),
            ring_buffer_size: sector.read_u64(super_offsets::RING_BUFFER_SIZE),
            oldest_lsid: sector.read_u64(super_offsets::OLDEST_LSID),
            written_lsid: sector.read_u64(super_offsets::WRITTEN_LSID),
        })
    }
}

/// One fixed-width log record, inline in a logpack header's record array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub flags: u32,
    /// Starting offset on the data device, in logical blocks.
    pub offset: u64,
    /// I/O size in logical blocks.
    pub io_size: u16,
    /// Offset of this record's payload within the pack, in `pb`.
    pub lsid_local: u16,
    /// Absolute lsid of this record (`logpack_lsid + lsid_local`).
    pub lsid: u64,
}

impl LogRecord {
    #[must_use]
    pub const fn is_exist(&self) -> bool {
        self.flags & RECORD_EXIST != 0
    }

    #[must_use]
    pub const fn is_padding(&self) -> bool {
        self.flags & RECORD_PADDING != 0
    }

    #[must_use]
    pub const fn is_discard(&self) -> bool {
        self.flags & RECORD_DISCARD != 0
    }

    fn write_to(self, sector: &mut SectorBuf, at: usize, payload_checksum: u32) {
        sector.write_u32(at + record_offsets::CHECKSUM, payload_checksum);
        sector.write_u32(at + record_offsets::FLAGS, self.flags);
        sector.write_u64(at + record_offsets::OFFSET, self.offset);
        sector.write_u16(at + record_offsets::IO_SIZE, self.io_size);
        sector.write_u16(at + record_offsets::LSID_LOCAL, self.lsid_local);
        sector.write_u64(at + record_offsets::LSID, self.lsid);
    }

    fn read_from(sector: &SectorBuf, at: usize) -> (Self, u32) {
        let payload_checksum = sector.read_u32(at + record_offsets::CHECKSUM);
        let record = Self {
            flags: sector.read_u32(at + record_offsets::FLAGS),
            offset: sector.read_u64(at + record_offsets::OFFSET),
            io_size: sector.read_u16(at + record_offsets::IO_SIZE),
            lsid_local: sector.read_u16(at + record_offsets::LSID_LOCAL),
            lsid: sector.read_u64(at + record_offsets::LSID),
        };
        (record, payload_checksum)
    }
}

/// Logpack header: one `pb` holding total-size bookkeeping plus an inline
/// array of up to `max_records(pbs)` log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogpackHeader {
    pub logpack_lsid: u64,
    /// Sum, in `pb`, of every non-discard record's payload span.
    pub total_io_size: u16,
    pub n_padding: u16,
    pub records: Vec<LogRecord>,
    /// Payload checksums, parallel to `records` (meaningless for discards).
    pub record_checksums: Vec<u32>,
}

impl LogpackHeader {
    /// The end marker: a header with no records, closing a wlog stream.
    #[must_use]
    pub fn end_marker(logpack_lsid: u64) -> Self {
        Self {
            logpack_lsid,
            total_io_size: 0,
            n_padding: 0,
            records: Vec::new(),
            record_checksums: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_end_marker(&self) -> bool {
        self.records.is_empty() && self.total_io_size == 0
    }

    #[must_use]
    pub fn max_records(pbs: usize) -> usize {
        (pbs - LOGPACK_HEADER_FIXED_SIZE) / LOG_RECORD_SIZE
    }

    /// The contiguous lsid span this pack occupies: `[logpack_lsid, end)`.
    #[must_use]
    pub fn end_lsid(&self) -> u64 {
        self.logpack_lsid + 1 + u64::from(self.total_io_size)
    }

    pub fn to_sector(&self, pbs: usize, salt: u32) -> Result<SectorBuf, FormatError> {
        let max = Self::max_records(pbs);
        if self.records.len() > max {
            return Err(FormatError::TooManyRecords {
                n_records: self.records.len() as u16,
                max: max as u16,
            });
        }
        let mut sector = SectorBuf::zeroed(pbs);
        sector.write_u16(header_offsets::SECTOR_TYPE, SECTOR_TYPE_LOGPACK);
        sector.write_u16(header_offsets::TOTAL_IO_SIZE, self.total_io_size);
        sector.write_u64(header_offsets::LOGPACK_LSID, self.logpack_lsid);
        sector.write_u16(header_offsets::N_RECORDS, self.records.len() as u16);
        sector.write_u16(header_offsets::N_PADDING, self.n_padding);

        for (i, record) in self.records.iter().enumerate() {
            let at = header_offsets::RECORDS + i * LOG_RECORD_SIZE;
            record.write_to(&mut sector, at, self.record_checksums[i]);
        }

        checksum::stamp(sector.as_bytes_mut(), header_offsets::CHECKSUM, salt);
        Ok(sector)
    }

    pub fn from_sector(sector: &SectorBuf, salt: u32) -> Result<Self, FormatError> {
        if !checksum::verify(sector.as_bytes(), salt) {
            return Err(FormatError::Checksum);
        }
        let sector_type = sector.read_u16(header_offsets::SECTOR_TYPE);
        if sector_type != SECTOR_TYPE_LOGPACK {
            return Err(FormatError::BadSectorType(sector_type));
        }
        let n_records = sector.read_u16(header_offsets::N_RECORDS);
        let max = Self::max_records(sector.len());
        if n_records as usize > max {
            return Err(FormatError::TooManyRecords {
                n_records,
                max: max as u16,
            });
        }

        let mut records = Vec::with_capacity(n_records as usize);
        let mut record_checksums = Vec::with_capacity(n_records as usize);
        for i in 0..n_records as usize {
            let at = header_offsets::RECORDS + i * LOG_RECORD_SIZE;
            let (record, payload_checksum) = LogRecord::read_from(sector, at);
            records.push(record);
            record_checksums.push(payload_checksum);
        }

        Ok(Self {
            logpack_lsid: sector.read_u64(header_offsets::LOGPACK_LSID),
            total_io_size: sector.read_u16(header_offsets::TOTAL_IO_SIZE),
            n_padding: sector.read_u16(header_offsets::N_PADDING),
            records,
            record_checksums,
        })
    }

    /// Keep only the first `k` records and recompute `total_io_size`/`n_padding`
    /// from what remains, using `lb_per_pb` to re-derive each record's `pb` span.
    /// Used by redo when a record past index `k` fails payload verification.
    pub fn shrink_to(&mut self, k: usize, lb_per_pb: u32) {
        self.records.truncate(k);
        self.record_checksums.truncate(k);
        self.n_padding = u16::from(self.records.iter().any(LogRecord::is_padding));
        self.total_io_size = self
            .records
            .iter()
            .filter(|r| !r.is_discard())
            .map(|r| pb_span(r.io_size, lb_per_pb))
            .sum();
    }
}

#[must_use]
fn pb_span(io_size_lb: u16, lb_per_pb: u32) -> u16 {
    let lb_per_pb = u64::from(lb_per_pb);
    (((u64::from(io_size_lb) + lb_per_pb - 1) / lb_per_pb) as u64) as u16
}

mod wlog_offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const SALT: usize = 8;
    pub const LOGICAL_BS: usize = 12;
    pub const PHYSICAL_BS: usize = 16;
    pub const UUID: usize = 20;
    pub const BEGIN_LSID: usize = 36;
    pub const END_LSID: usize = 44;
    pub const CHECKSUM: usize = 52;
}

/// Header of an extracted `wlog` stream file: one `pb` followed by the
/// logpacks in `[begin_lsid, end_lsid)` and an end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WlogStreamHeader {
    pub salt: u32,
    pub logical_bs: u32,
    pub physical_bs: u32,
    pub uuid: [u8; 16],
    pub begin_lsid: u64,
    pub end_lsid: u64,
}

/// Fixed size of a [`WlogStreamHeader`] sector: a reader must be able to
/// parse it before it knows the stream's `physical_bs`.
pub const WLOG_STREAM_HEADER_SIZE: usize = 512;

impl WlogStreamHeader {
    #[must_use]
    pub fn to_sector(&self) -> SectorBuf {
        let mut sector = SectorBuf::zeroed(WLOG_STREAM_HEADER_SIZE);
        sector.write_bytes(wlog_offsets::MAGIC, &WLOG_MAGIC);
        sector.write_u32(wlog_offsets::VERSION, WLOG_HEADER_VERSION);
        sector.write_u32(wlog_offsets::SALT, self.salt);
        sector.write_u32(wlog_offsets::LOGICAL_BS, self.logical_bs);
        sector.write_u32(wlog_offsets::PHYSICAL_BS, self.physical_bs);
        sector.write_bytes(wlog_offsets::UUID, &self.uuid);
        sector.write_u64(wlog_offsets::BEGIN_LSID, self.begin_lsid);
        sector.write_u64(wlog_offsets::END_LSID, self.end_lsid);
        checksum::stamp(sector.as_bytes_mut(), wlog_offsets::CHECKSUM, 0);
        sector
    }

    pub fn from_sector(sector: &SectorBuf) -> Result<Self, FormatError> {
        if !checksum::verify(sector.as_bytes(), 0) {
            return Err(FormatError::Checksum);
        }
        if sector.read_bytes(wlog_offsets::MAGIC, 4) != WLOG_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = sector.read_u32(wlog_offsets::VERSION);
        if version != WLOG_HEADER_VERSION {
            return Err(FormatError::BadVersion(version));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(sector.read_bytes(wlog_offsets::UUID, 16));

        Ok(Self {
            salt: sector.read_u32(wlog_offsets::SALT),
            logical_bs: sector.read_u32(wlog_offsets::LOGICAL_BS),
            physical_bs: sector.read_u32(wlog_offsets::PHYSICAL_BS),
            uuid,
            begin_lsid: sector.read_u64(wlog_offsets::BEGIN_LSID),
            end_lsid: sector.read_u64(wlog_offsets::END_LSID),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_super() -> SuperSector {
        SuperSector::new(512, 4096, 0, [7u8; 16], "walb0".to_string(), 0xf00d, 4096)
    }

    #[test]
    fn super_sector_round_trips() {
        let mut s = sample_super();
        s.oldest_lsid = 10;
        s.written_lsid = 20;
        let sector = s.to_sector().unwrap();
        let back = SuperSector::from_sector(&sector).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn super_sector_rejects_corruption() {
        let s = sample_super();
        let mut sector = s.to_sector().unwrap();
        let b = sector.as_bytes_mut();
        b[50] ^= 0xff;
        assert!(matches!(
            SuperSector::from_sector(&sector),
            Err(FormatError::Checksum)
        ));
    }

    #[test]
    fn super_sector_rejects_oversized_name() {
        let s = SuperSector::new(512, 4096, 0, [0; 16], "x".repeat(32), 0, 10);
        assert!(matches!(s.to_sector(), Err(FormatError::NameTooLong(32))));
    }

    fn sample_record(lsid: u64, lsid_local: u16, offset: u64, io_size: u16) -> LogRecord {
        LogRecord {
            flags: RECORD_EXIST,
            offset,
            io_size,
            lsid_local,
            lsid,
        }
    }

    #[test]
    fn logpack_header_round_trips() {
        let mut header = LogpackHeader {
            logpack_lsid: 100,
            total_io_size: 3,
            n_padding: 0,
            records: vec![sample_record(101, 1, 0, 8), sample_record(102, 2, 8, 8)],
            record_checksums: vec![111, 222],
        };
        header.total_io_size = 2;
        let sector = header.to_sector(512, 42).unwrap();
        let back = LogpackHeader::from_sector(&sector, 42).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn logpack_header_rejects_too_many_records() {
        let max = LogpackHeader::max_records(512);
        let mut records = Vec::new();
        let mut checksums = Vec::new();
        for i in 0..=max {
            records.push(sample_record(100 + i as u64, i as u16, 0, 1));
            checksums.push(0);
        }
        let header = LogpackHeader {
            logpack_lsid: 100,
            total_io_size: 0,
            n_padding: 0,
            records,
            record_checksums: checksums,
        };
        assert!(matches!(
            header.to_sector(512, 0),
            Err(FormatError::TooManyRecords { .. })
        ));
    }

    #[test]
    fn end_marker_has_no_records_and_zero_total() {
        let header = LogpackHeader::end_marker(500);
        assert!(header.is_end_marker());
        let sector = header.to_sector(512, 0).unwrap();
        let back = LogpackHeader::from_sector(&sector, 0).unwrap();
        assert!(back.is_end_marker());
        assert_eq!(back.logpack_lsid, 500);
    }

    #[test]
    fn shrink_to_recomputes_total_io_size_skipping_discards() {
        let mut header = LogpackHeader {
            logpack_lsid: 0,
            total_io_size: 99,
            n_padding: 0,
            records: vec![
                sample_record(1, 1, 0, 8),
                LogRecord {
                    flags: RECORD_EXIST | RECORD_DISCARD,
                    offset: 8,
                    io_size: 8,
                    lsid_local: 2,
                    lsid: 2,
                },
                sample_record(3, 3, 16, 16),
            ],
            record_checksums: vec![1, 2, 3],
        };
        header.shrink_to(2, 8);
        assert_eq!(header.records.len(), 2);
        assert_eq!(header.total_io_size, 1);
    }

    #[test]
    fn wlog_stream_header_round_trips() {
        let header = WlogStreamHeader {
            salt: 9,
            logical_bs: 512,
            physical_bs: 4096,
            uuid: [3u8; 16],
            begin_lsid: 0,
            end_lsid: 100,
        };
        let sector = header.to_sector();
        let back = WlogStreamHeader::from_sector(&sector).unwrap();
        assert_eq!(header, back);
    }
}
