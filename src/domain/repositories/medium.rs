//! Medium repository traits
//!
//! A medium is the read-only source of a recovery session: a physical
//! device or an image file. Nothing in this module can write to it.

use std::io;
use std::ops::Range;
use thiserror::Error;

/// Errors raised while reading a medium
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediumError {
    #[error("invalid request: {length} bytes at offset {offset} exceed medium size {size}")]
    InvalidRequest { offset: u64, length: u64, size: u64 },

    #[error("sector unreadable at offset {offset}")]
    SectorUnreadable { offset: u64 },

    #[error("medium unavailable: {0}")]
    Unavailable(String),
}

impl MediumError {
    /// Classifies an I/O error raised by a read at `offset`.
    ///
    /// Short reads and media errors are per-sector problems; anything that
    /// says the device itself is gone is fatal.
    pub fn from_io(err: &io::Error, offset: u64) -> Self {
        const EIO: i32 = 5;
        const ENXIO: i32 = 6;
        const ENODEV: i32 = 19;
        const ENODATA: i32 = 61;

        match err.raw_os_error() {
            Some(EIO) | Some(ENODATA) => return Self::SectorUnreadable { offset },
            Some(ENXIO) | Some(ENODEV) => return Self::Unavailable(err.to_string()),
            _ => {}
        }

        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe | io::ErrorKind::PermissionDenied => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::SectorUnreadable { offset },
        }
    }

    /// Whether this error must abort the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SectorUnreadable { .. })
    }
}

/// Static description of an opened medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumInfo {
    /// Device path or image name, for reports only
    pub label: String,
    /// Physical sector size in bytes
    pub sector_size: u32,
    /// Total addressable size in bytes
    pub total_size: u64,
}

impl MediumInfo {
    pub fn new(label: impl Into<String>, sector_size: u32, total_size: u64) -> Self {
        Self {
            label: label.into(),
            sector_size: sector_size.max(1),
            total_size,
        }
    }

    /// Number of whole or partial sectors
    pub fn total_sectors(&self) -> u64 {
        self.total_size.div_ceil(self.sector_size as u64)
    }

    /// Analysis handles are always read-only
    pub fn read_only(&self) -> bool {
        true
    }
}

/// Raw access to a medium.
///
/// Implementations make a single attempt per call; retry and zero-fill
/// policy lives in the reader that wraps them.
pub trait Medium: Send + Sync {
    /// Describes the medium
    fn info(&self) -> MediumInfo;

    /// Fills `buf` with the bytes at `offset`.
    ///
    /// The caller guarantees `offset + buf.len()` is within the medium.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MediumError>;
}

/// Bytes returned from a tolerant read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Requested bytes, zero-filled where unreadable
    pub data: Vec<u8>,
    /// Absolute ranges that could not be read, sorted and merged
    pub degraded: Vec<Range<u64>>,
}

impl ReadOutcome {
    pub fn fresh(data: Vec<u8>) -> Self {
        Self {
            data,
            degraded: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// Whether any byte of `range` came back zero-filled
    pub fn overlaps_degraded(&self, range: &Range<u64>) -> bool {
        self.degraded
            .iter()
            .any(|d| d.start < range.end && range.start < d.end)
    }
}

/// Read interface seen by parsers, the carver and the exporter.
///
/// Only the snapshot implements it in a session, so every consumer reads
/// through the cache.
pub trait ByteSource: Send + Sync {
    /// Total size of the addressable range
    fn size(&self) -> u64;

    /// Preferred sector granularity
    fn sector_size(&self) -> u32;

    /// Reads `length` bytes at `offset`, zero-filling unreadable sectors
    fn read(&self, offset: u64, length: usize) -> Result<ReadOutcome, MediumError>;
}

/// Appends `range` to a sorted list, merging with the last entry when adjacent.
pub(crate) fn push_merged(ranges: &mut Vec<Range<u64>>, range: Range<u64>) {
    if range.start >= range.end {
        return;
    }
    if let Some(last) = ranges.last_mut() {
        if last.end >= range.start {
            last.end = last.end.max(range.end);
            return;
        }
    }
    ranges.push(range);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let eio = io::Error::from_raw_os_error(5);
        assert_eq!(
            MediumError::from_io(&eio, 512),
            MediumError::SectorUnreadable { offset: 512 }
        );

        let gone = io::Error::from_raw_os_error(19);
        assert!(MediumError::from_io(&gone, 0).is_fatal());

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(!MediumError::from_io(&eof, 0).is_fatal());
    }

    #[test]
    fn merged_ranges_coalesce() {
        let mut ranges = Vec::new();
        push_merged(&mut ranges, 0..512);
        push_merged(&mut ranges, 512..1024);
        push_merged(&mut ranges, 2048..2560);
        assert_eq!(ranges, vec![0..1024, 2048..2560]);
    }

    #[test]
    fn total_sectors_rounds_up() {
        let info = MediumInfo::new("img", 512, 1025);
        assert_eq!(info.total_sectors(), 3);
        assert!(info.read_only());
    }
}
