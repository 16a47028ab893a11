//! FAT32 boot sector (BIOS Parameter Block)

use crate::domain::repositories::FileSystemError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const BOOT_SECTOR_SIZE: usize = 512;

/// "FAT32   " at offset 0x52
const FS_TYPE_LABEL: &[u8; 8] = b"FAT32   ";

/// Decoded BPB fields needed to address the volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat32BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub volume_label: String,
}

fn invalid(msg: impl Into<String>) -> FileSystemError {
    FileSystemError::InvalidBootSector(msg.into())
}

fn field<T>(value: std::io::Result<T>) -> Result<T, FileSystemError> {
    value.map_err(|e| invalid(e.to_string()))
}

impl Fat32BootSector {
    /// Parses and validates a boot sector
    pub fn parse(data: &[u8]) -> Result<Self, FileSystemError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(invalid("FAT32 boot sector too small"));
        }
        if data[510..512] != [0x55, 0xAA] {
            return Err(invalid("missing 0x55AA boot signature"));
        }
        if &data[0x52..0x5A] != FS_TYPE_LABEL {
            return Err(invalid("file system type label is not FAT32"));
        }

        let mut cursor = Cursor::new(data);

        // Bytes per sector at offset 11
        cursor.set_position(11);
        let bytes_per_sector = field(cursor.read_u16::<LittleEndian>())?;
        let sectors_per_cluster = field(cursor.read_u8())?;
        let reserved_sectors = field(cursor.read_u16::<LittleEndian>())?;
        let fat_count = field(cursor.read_u8())?;

        // 16-bit total at 19, 32-bit total at 32
        cursor.set_position(19);
        let total_sectors_16 = field(cursor.read_u16::<LittleEndian>())?;
        cursor.set_position(32);
        let total_sectors_32 = field(cursor.read_u32::<LittleEndian>())?;
        let sectors_per_fat = field(cursor.read_u32::<LittleEndian>())?;

        // Root directory cluster at offset 44
        cursor.set_position(44);
        let root_cluster = field(cursor.read_u32::<LittleEndian>())?;

        let volume_label = String::from_utf8_lossy(&data[0x47..0x52]).trim_end().to_string();

        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };

        let boot = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            total_sectors,
            sectors_per_fat,
            root_cluster,
            volume_label,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<(), FileSystemError> {
        if !self.bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&self.bytes_per_sector) {
            return Err(invalid(format!("bad bytes per sector {}", self.bytes_per_sector)));
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            return Err(invalid(format!(
                "bad sectors per cluster {}",
                self.sectors_per_cluster
            )));
        }
        if self.reserved_sectors == 0 || self.fat_count == 0 || self.sectors_per_fat == 0 {
            return Err(invalid("zero reserved sectors, FAT count or FAT size"));
        }
        if self.data_start_sector() >= self.total_sectors as u64 {
            return Err(invalid("data region starts past the end of the volume"));
        }
        if self.root_cluster < 2 || self.root_cluster as u64 >= self.cluster_count() + 2 {
            return Err(invalid(format!("root cluster {} out of range", self.root_cluster)));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Byte offset of FAT copy `index`, relative to the volume start
    pub fn fat_offset(&self, index: u8) -> u64 {
        (self.reserved_sectors as u64 + index as u64 * self.sectors_per_fat as u64)
            * self.bytes_per_sector as u64
    }

    pub fn fat_bytes(&self) -> u64 {
        self.sectors_per_fat as u64 * self.bytes_per_sector as u64
    }

    fn data_start_sector(&self) -> u64 {
        self.reserved_sectors as u64 + self.fat_count as u64 * self.sectors_per_fat as u64
    }

    /// Byte offset of cluster 2, relative to the volume start
    pub fn data_offset(&self) -> u64 {
        self.data_start_sector() * self.bytes_per_sector as u64
    }

    /// Number of data clusters, capped by what one FAT copy can describe
    pub fn cluster_count(&self) -> u64 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.data_start_sector());
        let by_size = data_sectors / self.sectors_per_cluster as u64;
        let by_fat = (self.fat_bytes() / 4).saturating_sub(2);
        by_size.min(by_fat)
    }
}
