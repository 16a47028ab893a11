//! Retrying medium reader
//!
//! Wraps a raw [`Medium`] with the bad-sector policy: try the whole span,
//! fall back to sector-by-sector reads with bounded retries and doubling
//! backoff, zero-fill what never reads and report it as degraded.

use crate::domain::repositories::{
    push_merged, ByteSource, Medium, MediumError, MediumInfo, ReadOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry with doubling backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts per unreadable sector
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping, for tests and healthy images
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Read counters
#[derive(Debug, Default)]
pub struct ReadStats {
    pub medium_reads: AtomicU64,
    pub retries: AtomicU64,
    pub degraded_sectors: AtomicU64,
}

/// Tolerant, read-only access to a medium
pub struct MediumReader {
    medium: Arc<dyn Medium>,
    info: MediumInfo,
    policy: RetryPolicy,
    stats: ReadStats,
}

impl MediumReader {
    pub fn new(medium: Arc<dyn Medium>, policy: RetryPolicy) -> Self {
        let info = medium.info();
        Self {
            medium,
            info,
            policy,
            stats: ReadStats::default(),
        }
    }

    pub fn info(&self) -> &MediumInfo {
        &self.info
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn stats(&self) -> &ReadStats {
        &self.stats
    }

    /// Reads `length` bytes at `offset`.
    ///
    /// Fails only on a request outside the medium or when the medium is
    /// gone; unreadable sectors come back zero-filled and listed in
    /// [`ReadOutcome::degraded`].
    pub fn read(&self, offset: u64, length: usize) -> Result<ReadOutcome, MediumError> {
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= self.info.total_size)
            .ok_or(MediumError::InvalidRequest {
                offset,
                length: length as u64,
                size: self.info.total_size,
            })?;

        if length == 0 {
            return Ok(ReadOutcome::default());
        }

        let mut data = vec![0u8; length];
        self.stats.medium_reads.fetch_add(1, Ordering::Relaxed);
        match self.medium.read_at(offset, &mut data) {
            Ok(()) => return Ok(ReadOutcome::fresh(data)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!(offset, length, error = %e, "span read failed, splitting into sectors"),
        }

        let sector_size = self.info.sector_size as u64;
        let mut degraded = Vec::new();
        let mut pos = offset;

        while pos < end {
            let sector_end = ((pos / sector_size + 1) * sector_size).min(end);
            let slice = &mut data[(pos - offset) as usize..(sector_end - offset) as usize];

            if !self.read_with_retry(pos, slice)? {
                slice.fill(0);
                self.stats.degraded_sectors.fetch_add(1, Ordering::Relaxed);
                warn!(offset = pos, len = sector_end - pos, "sector unreadable after retries, zero-filled");
                push_merged(&mut degraded, pos..sector_end);
            }
            pos = sector_end;
        }

        Ok(ReadOutcome { data, degraded })
    }

    /// Returns `Ok(false)` when every attempt hit a sector error
    fn read_with_retry(&self, offset: u64, buf: &mut [u8]) -> Result<bool, MediumError> {
        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                let delay = self.policy.backoff(attempt - 1);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }

            self.stats.medium_reads.fetch_add(1, Ordering::Relaxed);
            match self.medium.read_at(offset, buf) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => continue,
            }
        }
        Ok(false)
    }
}

impl ByteSource for MediumReader {
    fn size(&self) -> u64 {
        self.info.total_size
    }

    fn sector_size(&self) -> u32 {
        self.info.sector_size
    }

    fn read(&self, offset: u64, length: usize) -> Result<ReadOutcome, MediumError> {
        MediumReader::read(self, offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::medium::MemoryMedium;

    fn image() -> Vec<u8> {
        (0..4096u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn out_of_bounds_is_invalid_request() {
        let reader = MediumReader::new(Arc::new(MemoryMedium::new(image())), RetryPolicy::immediate(1));
        assert!(matches!(
            reader.read(4000, 200),
            Err(MediumError::InvalidRequest { .. })
        ));
        assert!(matches!(
            reader.read(u64::MAX, 2),
            Err(MediumError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn bad_sector_is_zero_filled_and_flagged() {
        let medium = MemoryMedium::new(image()).with_unreadable_at(1024);
        let reader = MediumReader::new(Arc::new(medium), RetryPolicy::immediate(2));

        let outcome = reader.read(512, 2048).unwrap();
        assert_eq!(outcome.degraded, vec![1024..1536]);
        assert!(outcome.data[512..1024].iter().all(|&b| b == 0));
        assert_eq!(outcome.data[0], image()[512]);
        assert_eq!(outcome.data[1024], image()[1536]);
        assert_eq!(reader.stats().retries.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn flaky_sector_recovers_within_retries() {
        let medium = MemoryMedium::new(image()).with_flaky_at(0, 2);
        let reader = MediumReader::new(Arc::new(medium), RetryPolicy::immediate(3));

        let outcome = reader.read(0, 1024).unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.data, image()[..1024].to_vec());
    }

    #[test]
    fn disconnection_is_fatal() {
        let medium = MemoryMedium::new(image());
        medium.disconnect();
        let reader = MediumReader::new(Arc::new(medium), RetryPolicy::immediate(3));
        assert!(matches!(reader.read(0, 512), Err(MediumError::Unavailable(_))));
    }
}
