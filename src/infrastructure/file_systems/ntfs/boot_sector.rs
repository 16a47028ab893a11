//! NTFS boot sector

use crate::domain::repositories::FileSystemError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// NTFS boot sector signature "NTFS    "
const NTFS_OEM_ID: [u8; 8] = [0x4E, 0x54, 0x46, 0x53, 0x20, 0x20, 0x20, 0x20];

pub const BOOT_SECTOR_SIZE: usize = 512;

/// Fields of the BIOS Parameter Block that locate the MFT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    /// Raw byte; values above 0x80 encode a power of two
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    /// Clusters per MFT record; negative means 2^|value| bytes
    pub clusters_per_mft_record: i8,
    pub volume_serial: u64,
}

fn invalid(msg: impl Into<String>) -> FileSystemError {
    FileSystemError::InvalidBootSector(msg.into())
}

fn field<T>(value: std::io::Result<T>) -> Result<T, FileSystemError> {
    value.map_err(|e| invalid(e.to_string()))
}

impl NtfsBootSector {
    /// Parses and validates the boot sector
    pub fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(invalid("NTFS boot sector too small"));
        }
        if data[3..11] != NTFS_OEM_ID {
            return Err(invalid("Invalid NTFS OEM ID"));
        }

        let mut cursor = Cursor::new(data);

        // Bytes per sector at offset 11
        cursor.set_position(11);
        let bytes_per_sector = field(cursor.read_u16::<LittleEndian>())?;

        // Sectors per cluster at offset 13
        let sectors_per_cluster = field(cursor.read_u8())?;

        // Total sectors at offset 40
        cursor.set_position(40);
        let total_sectors = field(cursor.read_u64::<LittleEndian>())?;

        // MFT LCN at offset 48, mirror at 56
        let mft_lcn = field(cursor.read_u64::<LittleEndian>())?;
        let mft_mirror_lcn = field(cursor.read_u64::<LittleEndian>())?;

        // Clusters per MFT record at offset 64
        let clusters_per_mft_record = field(cursor.read_i8())?;

        // Volume serial at offset 72
        cursor.set_position(72);
        let volume_serial = field(cursor.read_u64::<LittleEndian>())?;

        let boot = Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            clusters_per_mft_record,
            volume_serial,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<(), FileSystemError> {
        if !self.bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&self.bytes_per_sector) {
            return Err(invalid(format!("bad bytes per sector {}", self.bytes_per_sector)));
        }
        if self.sectors_per_cluster == 0 || self.sectors_per_cluster_count() > 1 << 16 {
            return Err(invalid(format!(
                "bad sectors per cluster {:#x}",
                self.sectors_per_cluster
            )));
        }
        if self.total_sectors == 0 {
            return Err(invalid("zero total sectors"));
        }
        if self.mft_lcn >= self.total_clusters() {
            return Err(invalid(format!("MFT cluster {} outside volume", self.mft_lcn)));
        }
        let record = self.mft_record_size();
        if !record.is_power_of_two() || !(256..=65_536).contains(&record) {
            return Err(invalid(format!("bad MFT record size {record}")));
        }
        Ok(())
    }

    fn sectors_per_cluster_count(&self) -> u64 {
        if self.sectors_per_cluster > 0x80 {
            1u64 << (256 - self.sectors_per_cluster as u32).min(31)
        } else {
            self.sectors_per_cluster as u64
        }
    }

    /// Returns the cluster size in bytes
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster_count()
    }

    /// Returns the MFT record size in bytes
    pub fn mft_record_size(&self) -> u64 {
        if self.clusters_per_mft_record > 0 {
            self.cluster_size() * self.clusters_per_mft_record as u64
        } else {
            // Negative value means 2^|value| bytes
            1u64 << (self.clusters_per_mft_record.unsigned_abs() as u64).min(31)
        }
    }

    /// Returns the MFT offset in bytes, relative to the volume start
    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size()
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster_count()
    }

    /// Returns total volume size in bytes
    pub fn volume_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector(spc: u8, per_record: i8) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[3..11].copy_from_slice(&NTFS_OEM_ID);
        data[11..13].copy_from_slice(&512u16.to_le_bytes());
        data[13] = spc;
        data[40..48].copy_from_slice(&8192u64.to_le_bytes());
        data[48..56].copy_from_slice(&4u64.to_le_bytes());
        data[64] = per_record as u8;
        data[510] = 0x55;
        data[511] = 0xAA;
        data
    }

    #[test]
    fn negative_record_size_is_a_power_of_two() {
        let boot = NtfsBootSector::parse(&boot_sector(8, -10)).unwrap();
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.mft_record_size(), 1024);
        assert_eq!(boot.mft_offset(), 16_384);
        assert_eq!(boot.total_clusters(), 1024);
    }

    #[test]
    fn large_cluster_encoding() {
        let boot = NtfsBootSector::parse(&boot_sector(0xF4, -10));
        // 2^12 sectors per cluster leaves the MFT cluster outside this tiny volume
        assert!(boot.is_err());
        let raw = NtfsBootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 0xF4,
            total_sectors: 1 << 20,
            mft_lcn: 2,
            mft_mirror_lcn: 3,
            clusters_per_mft_record: -10,
            volume_serial: 0,
        };
        assert_eq!(raw.cluster_size(), 512 << 12);
    }

    #[test]
    fn wrong_oem_is_rejected() {
        let mut data = boot_sector(8, -10);
        data[3] = b'X';
        assert!(NtfsBootSector::parse(&data).is_err());
    }
}
