//! Memory-mapped image medium
//!
//! Zero-copy access to healthy image files. A mapping cannot report
//! per-sector errors (the process gets SIGBUS instead), so flaky devices
//! should go through [`super::FileMedium`].

use crate::domain::repositories::{Medium, MediumError, MediumInfo};
use memmap2::Mmap;
use std::fs::OpenOptions;
use std::path::Path;

pub struct MmapMedium {
    mmap: Mmap,
    label: String,
}

impl MmapMedium {
    /// Maps an image file read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MediumError> {
        let path = path.as_ref();
        let label = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| MediumError::Unavailable(format!("{}: {}", label, e)))?;

        let len = file
            .metadata()
            .map_err(|e| MediumError::Unavailable(format!("{}: {}", label, e)))?
            .len();
        if len == 0 {
            return Err(MediumError::Unavailable(format!("{} has zero size", label)));
        }

        // SAFETY: the mapping is read-only and the image is not expected to
        // change underneath the session.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| MediumError::Unavailable(format!("failed to map {}: {}", label, e)))?;

        Ok(Self { mmap, label })
    }

    /// Returns a slice at the specified offset and length
    #[inline]
    pub fn slice_at(&self, offset: u64, length: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(length)?;
        self.mmap.get(start..end)
    }
}

impl Medium for MmapMedium {
    fn info(&self) -> MediumInfo {
        MediumInfo::new(self.label.clone(), 512, self.mmap.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MediumError> {
        let src = self
            .slice_at(offset, buf.len())
            .ok_or(MediumError::SectorUnreadable { offset })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mmap_read_at() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, memory-mapped world!").unwrap();
        file.flush().unwrap();

        let medium = MmapMedium::open(file.path()).unwrap();
        let mut buf = [0u8; 5];
        medium.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello");
        assert_eq!(medium.slice_at(7, 6), Some(&b"memory"[..]));
        assert_eq!(medium.slice_at(20, 100), None);
    }

    #[test]
    fn test_mmap_rejects_empty_image() {
        let file = NamedTempFile::new().unwrap();
        assert!(MmapMedium::open(file.path()).is_err());
    }
}
