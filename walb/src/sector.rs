//! A physical-block-sized buffer with typed little-endian field accessors.
//!
//! Unlike a fixed-size page, a [`SectorBuf`] is sized at construction time
//! from the device's `physical_bs`, since walb geometry is not pinned to any
//! one block size.

use std::fmt;

/// An owned, `pbs`-sized byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorBuf {
    data: Vec<u8>,
}

impl SectorBuf {
    /// Allocate a zeroed sector of `pbs` bytes.
    #[must_use]
    pub fn zeroed(pbs: usize) -> Self {
        Self { data: vec![0u8; pbs] }
    }

    /// Wrap an existing buffer, checking its length matches `pbs`.
    pub fn from_vec(data: Vec<u8>, pbs: usize) -> Result<Self, SectorError> {
        if data.len() != pbs {
            return Err(SectorError::WrongSize {
                expected: pbs,
                actual: data.len(),
            });
        }
        Ok(Self { data })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        let b = value.to_le_bytes();
        self.data[offset] = b[0];
        self.data[offset + 1] = b[1];
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        let b = value.to_le_bytes();
        self.data[offset..offset + 4].copy_from_slice(&b);
    }

    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
            self.data[offset + 4],
            self.data[offset + 5],
            self.data[offset + 6],
            self.data[offset + 7],
        ])
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        let b = value.to_le_bytes();
        self.data[offset..offset + 8].copy_from_slice(&b);
    }
}

/// A sector-sized buffer did not have the expected length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorError {
    WrongSize { expected: usize, actual: usize },
}

impl fmt::Display for SectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSize { expected, actual } => {
                write!(f, "expected a {expected}-byte sector, got {actual}")
            }
        }
    }
}

impl std::error::Error for SectorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field_width() {
        let mut s = SectorBuf::zeroed(64);
        s.write_u16(0, 0xabcd);
        s.write_u32(4, 0xdead_beef);
        s.write_u64(8, 0x0102_0304_0506_0708);
        s.write_bytes(16, &[9, 9, 9]);

        assert_eq!(s.read_u16(0), 0xabcd);
        assert_eq!(s.read_u32(4), 0xdead_beef);
        assert_eq!(s.read_u64(8), 0x0102_0304_0506_0708);
        assert_eq!(s.read_bytes(16, 3), &[9, 9, 9]);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = SectorBuf::from_vec(vec![0u8; 10], 16).unwrap_err();
        assert_eq!(
            err,
            SectorError::WrongSize {
                expected: 16,
                actual: 10
            }
        );
    }
}
