//! Recovery configuration DTO

use crate::infrastructure::medium::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Settings for one recovery session.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Snapshot block granularity; a multiple of the sector size
    pub cache_block_size: u64,
    /// Bad-sector retry policy
    pub retry: RetryPolicy,
    /// Bytes per carve window handed to one worker
    pub carve_chunk_size: u64,
    /// Carved candidates shorter than this are discarded
    pub min_candidate_size: u64,
    /// Restrict carving to these signature kinds (empty = all)
    pub signature_kinds: Vec<String>,
    /// Worker pool size (0 = one per core)
    pub worker_threads: usize,
    /// Overall timeout, treated as a cancellation request
    pub session_timeout_secs: Option<u64>,
    /// Persist the snapshot here and resume from it; in-memory if unset
    pub snapshot_dir: Option<PathBuf>,
    /// Run the signature pass
    pub carve: bool,
    /// Upper bound on MFT records examined
    pub max_mft_records: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cache_block_size: 64 * KIB,
            retry: RetryPolicy::default(),
            carve_chunk_size: 4 * MIB,
            min_candidate_size: 64,
            signature_kinds: Vec::new(),
            worker_threads: 0,
            session_timeout_secs: None,
            snapshot_dir: None,
            carve: true,
            max_mft_records: 1 << 20,
        }
    }
}

impl RecoveryConfig {
    /// Loads a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no session could run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.cache_block_size > 0, "cache_block_size must be positive");
        anyhow::ensure!(self.carve_chunk_size > 0, "carve_chunk_size must be positive");
        anyhow::ensure!(
            self.retry.initial_backoff_ms <= self.retry.max_backoff_ms,
            "retry.initial_backoff_ms exceeds retry.max_backoff_ms"
        );
        Ok(())
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }

    /// Sets the snapshot block size
    pub fn with_cache_block_size(mut self, size: u64) -> Self {
        self.cache_block_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the carve window size
    pub fn with_carve_chunk_size(mut self, size: u64) -> Self {
        self.carve_chunk_size = size;
        self
    }

    pub fn with_min_candidate_size(mut self, size: u64) -> Self {
        self.min_candidate_size = size;
        self
    }

    /// Restricts carving to the given kinds
    pub fn with_signature_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signature_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Persists the snapshot under `dir`
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Disables the signature pass
    pub fn without_carving(mut self) -> Self {
        self.carve = false;
        self
    }

    pub fn with_max_mft_records(mut self, records: u64) -> Self {
        self.max_mft_records = records;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.cache_block_size, 64 * 1024);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_backoff_ms, 5);
        assert_eq!(config.retry.max_backoff_ms, 500);
        assert_eq!(config.carve_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.min_candidate_size, 64);
        assert!(config.carve);
        assert_eq!(config.max_mft_records, 1_048_576);
        assert!(config.snapshot_dir.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "carve_chunk_size": 1048576, "retry": { "max_retries": 1 }, "signature_kinds": ["jpeg"] }"#,
        )
        .unwrap();

        let config = RecoveryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.carve_chunk_size, 1024 * 1024);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.max_backoff_ms, 500);
        assert_eq!(config.signature_kinds, vec!["jpeg".to_string()]);
        assert_eq!(config.cache_block_size, 64 * 1024);
    }

    #[test]
    fn invalid_files_carry_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "carve_chunk_size": 0 }"#).unwrap();
        let err = RecoveryConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("carve_chunk_size"));

        let missing = RecoveryConfig::from_json_file(dir.path().join("nope.json")).unwrap_err();
        assert!(format!("{missing:#}").contains("reading config"));
    }
}
