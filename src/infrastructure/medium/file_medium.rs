//! File-backed medium
//!
//! Raw read access to block devices (/dev/sdX) and image files through a
//! handle opened read-only. Reads are positioned, so no mutex is needed.

use super::positioned;
use crate::domain::repositories::{Medium, MediumError, MediumInfo};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

/// Device or image file opened for reading only
///
/// # Example
///
/// ```ignore
/// let medium = FileMedium::open("/dev/sdb")?;
/// let mut sector = [0u8; 512];
/// medium.read_at(0, &mut sector)?;
/// ```
pub struct FileMedium {
    file: File,
    label: String,
    size: u64,
    sector_size: u32,
}

impl FileMedium {
    /// Opens a device or image read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MediumError> {
        let path = path.as_ref();
        let label = path.display().to_string();

        if !path.exists() {
            return Err(MediumError::Unavailable(format!("{} not found", label)));
        }

        let file = OpenOptions::new().read(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                MediumError::Unavailable(format!("{} - permission denied, try running with sudo", label))
            } else {
                MediumError::Unavailable(format!("{}: {}", label, e))
            }
        })?;

        let size = Self::detect_size(&file, &label)?;
        let sector_size = Self::detect_sector_size(path);

        tracing::debug!(path = %label, size, sector_size, "opened medium");

        Ok(Self {
            file,
            label,
            size,
            sector_size,
        })
    }

    /// Regular files report their length; block devices are sized by
    /// seeking to the end of a cloned handle
    fn detect_size(file: &File, label: &str) -> Result<u64, MediumError> {
        let metadata = file
            .metadata()
            .map_err(|e| MediumError::Unavailable(format!("{}: {}", label, e)))?;

        if metadata.is_file() {
            return Ok(metadata.len());
        }

        let mut probe = file
            .try_clone()
            .map_err(|e| MediumError::Unavailable(format!("{}: {}", label, e)))?;
        let size = probe
            .seek(SeekFrom::End(0))
            .map_err(|e| MediumError::Unavailable(format!("{}: {}", label, e)))?;

        if size == 0 {
            Err(MediumError::Unavailable(format!("could not determine size of {}", label)))
        } else {
            Ok(size)
        }
    }

    fn detect_sector_size(path: &Path) -> u32 {
        if path.starts_with("/dev/") {
            4096 // Modern devices typically use 4K sectors
        } else {
            512 // Image files use the logical sector size
        }
    }
}

impl Medium for FileMedium {
    fn info(&self) -> MediumInfo {
        MediumInfo::new(self.label.clone(), self.sector_size, self.size)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MediumError> {
        positioned::read_exact_at(&self.file, buf, offset).map_err(|e| MediumError::from_io(&e, offset))
    }
}
