//! Ring geometry: mapping an lsid to a physical sector offset.
//!
//! Layout, in units of `pb` from the start of the log device:
//! `0` is reserved, `1` is the primary super sector, `1 + snapshot_metadata_size`
//! is reserved, `1 + 2*snapshot_metadata_size` is the secondary super sector,
//! and `ring_buffer_offset = 1 + 2*snapshot_metadata_size + 1` begins the ring.
#![allow(clippy::cast_possible_truncation)]

use crate::error::GeometryError;

/// Immutable geometry parameters of a log device, derived once at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub logical_bs: u32,
    pub physical_bs: u32,
    pub snapshot_metadata_size: u32,
    pub ring_buffer_size: u64,
}

impl Geometry {
    pub fn new(
        logical_bs: u32,
        physical_bs: u32,
        snapshot_metadata_size: u32,
        ring_buffer_size: u64,
    ) -> Result<Self, GeometryError> {
        if ring_buffer_size == 0 {
            return Err(GeometryError::ZeroRingBufferSize);
        }
        if physical_bs % logical_bs != 0 {
            return Err(GeometryError::BlockSizeMismatch {
                logical_bs,
                physical_bs,
            });
        }
        Ok(Self {
            logical_bs,
            physical_bs,
            snapshot_metadata_size,
            ring_buffer_size,
        })
    }

    /// Logical blocks per physical block.
    #[must_use]
    pub fn lb_per_pb(&self) -> u32 {
        self.physical_bs / self.logical_bs
    }

    /// Number of `pb` occupied by `io_size_lb` logical blocks, rounded up.
    #[must_use]
    pub fn pb_span(&self, io_size_lb: u16) -> u16 {
        let lb_per_pb = u64::from(self.lb_per_pb());
        let span = (u64::from(io_size_lb) + lb_per_pb - 1) / lb_per_pb;
        span as u16
    }

    /// First `pb` offset of the ring buffer, relative to the start of the log device.
    #[must_use]
    pub fn ring_buffer_offset(&self) -> u64 {
        1 + 2 * u64::from(self.snapshot_metadata_size) + 1
    }

    /// Physical sector offset of `lsid`, relative to the start of the log device.
    #[must_use]
    pub fn offset_of_lsid(&self, lsid: u64) -> u64 {
        self.ring_buffer_offset() + (lsid % self.ring_buffer_size)
    }

    /// `pb` remaining in the current revolution starting at `lsid`, i.e. how
    /// many contiguous `pb` can be written before the ring wraps.
    #[must_use]
    pub fn pb_until_wrap(&self, lsid: u64) -> u64 {
        self.ring_buffer_size - (lsid % self.ring_buffer_size)
    }
}
