//! Filesystem detection and parser selection

use super::fat32::{Fat32BootSector, Fat32Parser};
use super::mbr;
use super::ntfs::{NtfsBootSector, NtfsParser};
use crate::domain::entities::FileSystemForest;
use crate::domain::repositories::{ByteSource, FileSystemError, FileSystemKind, FileSystemParser};
use crate::domain::services::CancellationToken;
use tracing::{debug, info};

const SECTOR: usize = 512;

/// Outcome of boot-sector probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Known {
        kind: FileSystemKind,
        volume_offset: u64,
    },
    /// Nothing recognised; recovery relies on carving alone
    Unknown,
}

/// Probes in fixed order: NTFS then FAT32 at offset 0, then the same for
/// each primary MBR partition.
///
/// An unreadable boot sector yields `Unknown`, never an error.
pub fn detect(source: &dyn ByteSource) -> Detection {
    let Some(sector0) = read_sector(source, 0) else {
        debug!("sector 0 unreadable, no filesystem detected");
        return Detection::Unknown;
    };

    if let Some(kind) = probe(&sector0) {
        info!(%kind, volume_offset = 0, "filesystem detected");
        return Detection::Known {
            kind,
            volume_offset: 0,
        };
    }

    for partition in mbr::partitions(&sector0) {
        let offset = partition.byte_offset();
        let Some(boot) = read_sector(source, offset) else {
            continue;
        };
        if let Some(kind) = probe(&boot) {
            if partition.kind_hint().is_some_and(|hint| hint != kind) {
                debug!(slot = partition.slot, type_byte = partition.type_byte, %kind, "partition type disagrees with boot sector");
            }
            info!(%kind, volume_offset = offset, slot = partition.slot, "filesystem detected in partition");
            return Detection::Known {
                kind,
                volume_offset: offset,
            };
        }
    }

    Detection::Unknown
}

fn read_sector(source: &dyn ByteSource, offset: u64) -> Option<Vec<u8>> {
    if offset + SECTOR as u64 > source.size() {
        return None;
    }
    match source.read(offset, SECTOR) {
        Ok(outcome) if !outcome.is_degraded() => Some(outcome.data),
        _ => None,
    }
}

fn probe(sector: &[u8]) -> Option<FileSystemKind> {
    if NtfsBootSector::parse(sector).is_ok() {
        Some(FileSystemKind::Ntfs)
    } else if Fat32BootSector::parse(sector).is_ok() {
        Some(FileSystemKind::Fat32)
    } else {
        None
    }
}

/// Parser selected for a detected volume
pub enum VolumeParser {
    Fat32(Fat32Parser),
    Ntfs(NtfsParser),
}

impl VolumeParser {
    /// Opens the parser for a detection; `None` for `Unknown`
    pub fn open(
        source: &dyn ByteSource,
        detection: Detection,
        max_mft_records: u64,
    ) -> Result<Option<Self>, FileSystemError> {
        let Detection::Known {
            kind,
            volume_offset,
        } = detection
        else {
            return Ok(None);
        };
        let parser = match kind {
            FileSystemKind::Fat32 => Self::Fat32(Fat32Parser::open(source, volume_offset)?),
            FileSystemKind::Ntfs => {
                Self::Ntfs(NtfsParser::open(source, volume_offset, max_mft_records)?)
            }
        };
        Ok(Some(parser))
    }
}

impl FileSystemParser for VolumeParser {
    fn kind(&self) -> FileSystemKind {
        match self {
            Self::Fat32(p) => p.kind(),
            Self::Ntfs(p) => p.kind(),
        }
    }

    fn parse(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
    ) -> Result<FileSystemForest, FileSystemError> {
        match self {
            Self::Fat32(p) => p.parse(source, cancel),
            Self::Ntfs(p) => p.parse(source, cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::medium::{MediumReader, MemoryMedium, RetryPolicy};
    use std::sync::Arc;

    fn reader(data: Vec<u8>, unreadable: Option<u64>) -> MediumReader {
        let mut medium = MemoryMedium::new(data);
        if let Some(offset) = unreadable {
            medium = medium.with_unreadable_at(offset);
        }
        MediumReader::new(Arc::new(medium), RetryPolicy::immediate(0))
    }

    fn ntfs_boot() -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[3..11].copy_from_slice(b"NTFS    ");
        data[11..13].copy_from_slice(&512u16.to_le_bytes());
        data[13] = 8;
        data[40..48].copy_from_slice(&4096u64.to_le_bytes());
        data[48..56].copy_from_slice(&4u64.to_le_bytes());
        data[64] = 0xF6;
        data[510] = 0x55;
        data[511] = 0xAA;
        data
    }

    #[test]
    fn zeroed_medium_is_unknown() {
        assert_eq!(detect(&reader(vec![0u8; 8192], None)), Detection::Unknown);
    }

    #[test]
    fn ntfs_at_offset_zero() {
        let mut image = vec![0u8; 8192];
        image[..512].copy_from_slice(&ntfs_boot());
        assert_eq!(
            detect(&reader(image, None)),
            Detection::Known {
                kind: FileSystemKind::Ntfs,
                volume_offset: 0
            }
        );
    }

    #[test]
    fn ntfs_inside_partition() {
        let mut image = vec![0u8; 4 * 4096];
        image[446 + 4] = 0x07;
        image[446 + 8..446 + 12].copy_from_slice(&8u32.to_le_bytes());
        image[446 + 12..446 + 16].copy_from_slice(&4096u32.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;
        image[4096..4608].copy_from_slice(&ntfs_boot());

        assert_eq!(
            detect(&reader(image, None)),
            Detection::Known {
                kind: FileSystemKind::Ntfs,
                volume_offset: 4096
            }
        );
    }

    #[test]
    fn unreadable_boot_sector_is_unknown() {
        let mut image = vec![0u8; 8192];
        image[..512].copy_from_slice(&ntfs_boot());
        assert_eq!(detect(&reader(image, Some(0))), Detection::Unknown);
    }
}
