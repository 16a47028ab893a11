//! Master boot record partition table

use crate::domain::repositories::FileSystemKind;
use byteorder::{ByteOrder, LittleEndian};

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const LBA_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartitionEntry {
    pub slot: usize,
    pub type_byte: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub fn byte_offset(&self) -> u64 {
        self.start_lba as u64 * LBA_SIZE
    }

    /// Filesystem suggested by the partition type byte
    pub fn kind_hint(&self) -> Option<FileSystemKind> {
        match self.type_byte {
            0x0B | 0x0C | 0x1B | 0x1C => Some(FileSystemKind::Fat32),
            0x07 => Some(FileSystemKind::Ntfs),
            _ => None,
        }
    }
}

/// Non-empty primary partitions of a sector 0 carrying the 0x55AA mark
pub(crate) fn partitions(sector0: &[u8]) -> Vec<PartitionEntry> {
    if sector0.len() < 512 || sector0[510..512] != [0x55, 0xAA] {
        return Vec::new();
    }

    (0..4)
        .filter_map(|slot| {
            let entry = &sector0[TABLE_OFFSET + slot * ENTRY_SIZE..][..ENTRY_SIZE];
            let type_byte = entry[4];
            let start_lba = LittleEndian::read_u32(&entry[8..]);
            let sector_count = LittleEndian::read_u32(&entry[12..]);
            (type_byte != 0 && start_lba != 0 && sector_count != 0).then_some(PartitionEntry {
                slot,
                type_byte,
                start_lba,
                sector_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_primary_entries() {
        let mut sector = vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let entry = &mut sector[TABLE_OFFSET + ENTRY_SIZE..TABLE_OFFSET + 2 * ENTRY_SIZE];
        entry[4] = 0x0C;
        entry[8..12].copy_from_slice(&2048u32.to_le_bytes());
        entry[12..16].copy_from_slice(&65_536u32.to_le_bytes());

        let parts = partitions(&sector);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].slot, 1);
        assert_eq!(parts[0].byte_offset(), 1_048_576);
        assert_eq!(parts[0].kind_hint(), Some(FileSystemKind::Fat32));
    }

    #[test]
    fn missing_signature_means_no_table() {
        assert!(partitions(&[0u8; 512]).is_empty());
    }
}
