//! Block device abstraction.
//!
//! Production code talks to `std::fs::File` at `pb` granularity; tests run
//! against an in-memory device so that crash points, short reads, and
//! corruption can be injected deterministically without touching a real
//! file.
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::error::DeviceError;

/// A block device addressed in `pb`-sized sectors.
///
/// Implementations must ensure `read_at` returns the last `write_at` content
/// for a given offset, and that `flush` makes all previous writes durable.
pub trait BlockDevice: Send + Sync {
    /// Physical block size in bytes.
    fn physical_bs(&self) -> usize;

    /// Device capacity in `pb`.
    fn capacity_pb(&self) -> u64;

    /// Read `buf.len()` bytes starting at `pb_offset` physical blocks from
    /// the start of the device. `buf.len()` must be a multiple of `physical_bs`.
    fn read_at(&self, pb_offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write `buf` starting at `pb_offset`. May be buffered until `flush`.
    fn write_at(&self, pb_offset: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Make all previous writes durable.
    fn flush(&self) -> Result<(), DeviceError>;

    /// Best-effort discard of `[pb_offset, pb_offset+len_pb)`. Devices that
    /// do not support discard may treat this as a no-op.
    fn discard(&self, pb_offset: u64, len_pb: u64) -> Result<(), DeviceError> {
        let _ = (pb_offset, len_pb);
        Ok(())
    }
}

fn check_bounds(pb_offset: u64, buf_len: usize, physical_bs: usize, capacity_pb: u64) -> Result<(), DeviceError> {
    if buf_len % physical_bs != 0 {
        return Err(DeviceError::OutOfRange {
            offset: pb_offset,
            len: buf_len as u64,
            capacity: capacity_pb,
        });
    }
    let len_pb = (buf_len / physical_bs) as u64;
    if pb_offset + len_pb > capacity_pb {
        return Err(DeviceError::OutOfRange {
            offset: pb_offset,
            len: len_pb,
            capacity: capacity_pb,
        });
    }
    Ok(())
}

/// A file-backed block device, used against the real log and data devices.
pub struct FileDevice {
    file: File,
    physical_bs: usize,
    capacity_pb: u64,
}

impl FileDevice {
    /// Open an existing file, treating it as `capacity_pb` blocks of
    /// `physical_bs` bytes.
    pub fn open(path: &Path, physical_bs: usize, capacity_pb: u64) -> Result<Self, DeviceError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            physical_bs,
            capacity_pb,
        })
    }

    /// Create a new file of exactly `capacity_pb * physical_bs` bytes.
    pub fn create(path: &Path, physical_bs: usize, capacity_pb: u64) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity_pb * physical_bs as u64)?;
        Ok(Self {
            file,
            physical_bs,
            capacity_pb,
        })
    }
}

impl BlockDevice for FileDevice {
    fn physical_bs(&self) -> usize {
        self.physical_bs
    }

    fn capacity_pb(&self) -> u64 {
        self.capacity_pb
    }

    fn read_at(&self, pb_offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_bounds(pb_offset, buf.len(), self.physical_bs, self.capacity_pb)?;
        self.file.read_exact_at(buf, pb_offset * self.physical_bs as u64)?;
        Ok(())
    }

    fn write_at(&self, pb_offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_bounds(pb_offset, buf.len(), self.physical_bs, self.capacity_pb)?;
        self.file.write_all_at(buf, pb_offset * self.physical_bs as u64)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// An in-memory device for tests: deterministic, no real fsync semantics,
/// but the same bounds checking and sector granularity as `FileDevice`.
pub struct MemDevice {
    physical_bs: usize,
    capacity_pb: u64,
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(physical_bs: usize, capacity_pb: u64) -> Self {
        Self {
            physical_bs,
            capacity_pb,
            data: Mutex::new(vec![0u8; physical_bs * capacity_pb as usize]),
        }
    }
}

impl BlockDevice for MemDevice {
    fn physical_bs(&self) -> usize {
        self.physical_bs
    }

    fn capacity_pb(&self) -> u64 {
        self.capacity_pb
    }

    fn read_at(&self, pb_offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_bounds(pb_offset, buf.len(), self.physical_bs, self.capacity_pb)?;
        let start = (pb_offset * self.physical_bs as u64) as usize;
        let data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, pb_offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_bounds(pb_offset, buf.len(), self.physical_bs, self.capacity_pb)?;
        let start = (pb_offset * self.physical_bs as u64) as usize;
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemDevice::new(512, 16);
        let buf = vec![7u8; 512];
        dev.write_at(3, &buf).unwrap();
        let mut out = vec![0u8; 512];
        dev.read_at(3, &mut out).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn mem_device_rejects_out_of_range() {
        let dev = MemDevice::new(512, 4);
        let buf = vec![0u8; 512];
        assert!(matches!(
            dev.write_at(4, &buf),
            Err(DeviceError::OutOfRange { .. })
        ));
    }

    #[test]
    fn mem_device_rejects_misaligned_buffer() {
        let dev = MemDevice::new(512, 4);
        let mut buf = vec![0u8; 100];
        assert!(matches!(
            dev.read_at(0, &mut buf),
            Err(DeviceError::OutOfRange { .. })
        ));
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let dev = FileDevice::create(&path, 512, 16).unwrap();
        let buf = vec![42u8; 1024];
        dev.write_at(2, &buf).unwrap();
        dev.flush().unwrap();

        let reopened = FileDevice::open(&path, 512, 16).unwrap();
        let mut out = vec![0u8; 1024];
        reopened.read_at(2, &mut out).unwrap();
        assert_eq!(out, buf);
    }
}
