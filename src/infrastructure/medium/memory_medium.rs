//! In-memory medium
//!
//! Holds a whole image in memory. Sectors can be made permanently or
//! transiently unreadable and the medium can be "unplugged", which makes
//! it the backend of choice for exercising the retry and resume paths.

use crate::domain::repositories::{Medium, MediumError, MediumInfo};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct MemoryMedium {
    data: Vec<u8>,
    label: String,
    sector_size: u32,
    unreadable: HashSet<u64>,
    /// Sector index -> failures left before it reads
    flaky: Mutex<HashMap<u64, u32>>,
    disconnected: AtomicBool,
    disconnect_after: Option<u64>,
    reads: AtomicU64,
}

impl MemoryMedium {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            label: "memory".to_string(),
            sector_size: 512,
            unreadable: HashSet::new(),
            flaky: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
            disconnect_after: None,
            reads: AtomicU64::new(0),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size.max(1);
        self
    }

    /// Makes the sector containing `offset` fail on every read
    pub fn with_unreadable_at(mut self, offset: u64) -> Self {
        self.unreadable.insert(offset / self.sector_size as u64);
        self
    }

    /// Makes the sector containing `offset` fail `failures` times first
    pub fn with_flaky_at(self, offset: u64, failures: u32) -> Self {
        let sector = offset / self.sector_size as u64;
        self.flaky.lock().insert(sector, failures);
        self
    }

    /// Unplugs the medium once `reads` read calls have been served
    pub fn with_disconnect_after(mut self, reads: u64) -> Self {
        self.disconnect_after = Some(reads);
        self
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Image bytes, for before/after comparisons
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Number of `read_at` calls served or refused
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Medium for MemoryMedium {
    fn info(&self) -> MediumInfo {
        MediumInfo::new(self.label.clone(), self.sector_size, self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), MediumError> {
        let served = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.disconnected.load(Ordering::SeqCst)
            || self.disconnect_after.is_some_and(|limit| served >= limit)
        {
            return Err(MediumError::Unavailable(format!("{} disconnected", self.label)));
        }

        let end = offset + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(MediumError::SectorUnreadable { offset });
        }

        let ss = self.sector_size as u64;
        let first = offset / ss;
        let last = end.div_ceil(ss);
        for sector in first..last {
            if self.unreadable.contains(&sector) {
                return Err(MediumError::SectorUnreadable { offset: sector * ss });
            }
            let mut flaky = self.flaky.lock();
            if let Some(left) = flaky.get_mut(&sector) {
                if *left > 0 {
                    *left -= 1;
                    return Err(MediumError::SectorUnreadable { offset: sector * ss });
                }
            }
        }

        buf.copy_from_slice(&self.data[offset as usize..end as usize]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_sector_fails_spanning_reads() {
        let medium = MemoryMedium::new(vec![1u8; 4096]).with_unreadable_at(1024);
        let mut buf = vec![0u8; 2048];
        assert_eq!(
            medium.read_at(0, &mut buf),
            Err(MediumError::SectorUnreadable { offset: 1024 })
        );
        assert!(medium.read_at(2048, &mut buf).is_ok());
        assert_eq!(medium.read_count(), 2);
    }

    #[test]
    fn flaky_sector_recovers() {
        let medium = MemoryMedium::new(vec![2u8; 1024]).with_flaky_at(0, 1);
        let mut buf = [0u8; 512];
        assert!(medium.read_at(0, &mut buf).is_err());
        assert!(medium.read_at(0, &mut buf).is_ok());
    }

    #[test]
    fn disconnect_is_fatal() {
        let medium = MemoryMedium::new(vec![0u8; 1024]).with_disconnect_after(1);
        let mut buf = [0u8; 512];
        assert!(medium.read_at(0, &mut buf).is_ok());
        assert!(medium.read_at(0, &mut buf).unwrap_err().is_fatal());
    }
}
