//! Error taxonomy for the write-ahead log engine.
//!
//! Leaf errors describe a single subsystem's failure mode; [`WalbError`] is
//! the taxonomy exposed at the control surface (see §7 of the design notes:
//! `BadFormat`, `IoFailure`, `LogOverflow`, `InvalidArg`, `Transient`, `State`).

use std::fmt;

/// A checksum did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumError;

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checksum mismatch")
    }
}

impl std::error::Error for ChecksumError {}

/// Ring geometry or lsid arithmetic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// `ring_buffer_size` was zero.
    ZeroRingBufferSize,
    /// `physical_bs` is not a multiple of `logical_bs`.
    BlockSizeMismatch { logical_bs: u32, physical_bs: u32 },
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroRingBufferSize => write!(f, "ring buffer size must be positive"),
            Self::BlockSizeMismatch {
                logical_bs,
                physical_bs,
            } => write!(
                f,
                "physical block size {physical_bs} is not a multiple of logical block size {logical_bs}"
            ),
        }
    }
}

impl std::error::Error for GeometryError {}

/// On-disk structure failed type, checksum, or cross-field validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Magic bytes did not match.
    BadMagic,
    /// `sector_type` field held an unexpected value.
    BadSectorType(u16),
    /// `version` field held an unsupported value.
    BadVersion(u32),
    /// Salted checksum did not verify.
    Checksum,
    /// `n_records` exceeded the header's record capacity for this `pbs`.
    TooManyRecords { n_records: u16, max: u16 },
    /// `name` exceeded the reserved field width.
    NameTooLong(usize),
    /// A sector or payload read came back short.
    Truncated { expected: usize, actual: usize },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad magic bytes"),
            Self::BadSectorType(t) => write!(f, "unexpected sector type {t}"),
            Self::BadVersion(v) => write!(f, "unsupported format version {v}"),
            Self::Checksum => write!(f, "salted checksum did not verify"),
            Self::TooManyRecords { n_records, max } => {
                write!(f, "{n_records} records exceeds capacity {max}")
            }
            Self::NameTooLong(len) => write!(f, "name of {len} bytes exceeds reserved field"),
            Self::Truncated { expected, actual } => {
                write!(f, "expected {expected} bytes, read {actual}")
            }
        }
    }
}

impl std::error::Error for FormatError {}

/// Pack builder could not accept a descriptor as requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackError {
    /// The pack is already at record or `total_io_size` capacity.
    Full,
    /// A write descriptor's `io_size` was zero.
    ZeroLengthIo,
    /// lsid arithmetic would overflow `u64`.
    LsidOverflow,
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "pack is full"),
            Self::ZeroLengthIo => write!(f, "io descriptor has zero length"),
            Self::LsidOverflow => write!(f, "lsid arithmetic overflowed"),
        }
    }
}

impl std::error::Error for PackError {}

/// Underlying block device I/O failure.
#[derive(Debug)]
pub enum DeviceError {
    /// Propagated `std::io::Error`.
    Io(std::io::Error),
    /// Requested range fell outside the device.
    OutOfRange { offset: u64, len: u64, capacity: u64 },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "device I/O error: {e}"),
            Self::OutOfRange {
                offset,
                len,
                capacity,
            } => write!(f, "range [{offset}, {offset}+{len}) exceeds device capacity {capacity}"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::OutOfRange { .. } => None,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Crash-recovery (redo) failure.
#[derive(Debug)]
pub enum RedoError {
    /// A logpack or super sector failed validation.
    Format(FormatError),
    /// The underlying device failed.
    Device(DeviceError),
}

impl fmt::Display for RedoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(e) => write!(f, "redo format error: {e}"),
            Self::Device(e) => write!(f, "redo device error: {e}"),
        }
    }
}

impl std::error::Error for RedoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Format(e) => Some(e),
            Self::Device(e) => Some(e),
        }
    }
}

impl From<FormatError> for RedoError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

impl From<DeviceError> for RedoError {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

/// Error taxonomy exposed at the control surface.
#[derive(Debug)]
pub enum WalbError {
    /// A sector failed type, checksum, or cross-field validation.
    BadFormat(FormatError),
    /// Underlying device read/write failed.
    IoFailure(DeviceError),
    /// `latest - oldest` would exceed `ring_buffer_size`.
    LogOverflow,
    /// Bad lsid range, size, or name.
    InvalidArg(String),
    /// Admission backpressure exceeded `queue_stop_timeout_ms`.
    Transient(String),
    /// Operation disallowed in the current freeze or `READ_ONLY` state.
    State(String),
}

impl fmt::Display for WalbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFormat(e) => write!(f, "bad format: {e}"),
            Self::IoFailure(e) => write!(f, "I/O failure: {e}"),
            Self::LogOverflow => write!(f, "log overflow"),
            Self::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            Self::Transient(msg) => write!(f, "transient failure: {msg}"),
            Self::State(msg) => write!(f, "disallowed in current state: {msg}"),
        }
    }
}

impl std::error::Error for WalbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadFormat(e) => Some(e),
            Self::IoFailure(e) => Some(e),
            Self::LogOverflow
            | Self::InvalidArg(_)
            | Self::Transient(_)
            | Self::State(_) => None,
        }
    }
}

impl From<FormatError> for WalbError {
    fn from(e: FormatError) -> Self {
        Self::BadFormat(e)
    }
}

impl From<DeviceError> for WalbError {
    fn from(e: DeviceError) -> Self {
        Self::IoFailure(e)
    }
}

impl From<GeometryError> for WalbError {
    fn from(e: GeometryError) -> Self {
        Self::InvalidArg(e.to_string())
    }
}

impl From<PackError> for WalbError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::Full | PackError::LsidOverflow => Self::State(e.to_string()),
            PackError::ZeroLengthIo => Self::InvalidArg(e.to_string()),
        }
    }
}

impl From<RedoError> for WalbError {
    fn from(e: RedoError) -> Self {
        match e {
            RedoError::Format(fe) => Self::BadFormat(fe),
            RedoError::Device(de) => Self::IoFailure(de),
        }
    }
}

impl From<ChecksumError> for WalbError {
    fn from(_: ChecksumError) -> Self {
        Self::BadFormat(FormatError::Checksum)
    }
}
