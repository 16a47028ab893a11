//! Copy-on-read snapshot of the medium
//!
//! Every consumer reads through the snapshot, which reads each aligned
//! block from the medium at most once per session and can persist what it
//! read so a later session resumes without touching those blocks again.

mod block_table;
mod cache;
mod manifest;

pub use cache::{Snapshot, SnapshotStats};
pub use manifest::{
    BlockRecord, ManifestHeader, ManifestJournal, MediumIdentity, ScanCursor, SessionManifest,
    MANIFEST_VERSION,
};

use crate::domain::repositories::MediumError;
use thiserror::Error;

/// File names inside a snapshot directory
pub const MANIFEST_FILE: &str = "manifest.jsonl";
pub const IMAGE_FILE: &str = "snapshot.img";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Medium(#[from] MediumError),

    #[error("snapshot store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("manifest belongs to a different medium (expected {expected}, found {found})")]
    IdentityMismatch { expected: String, found: String },

    #[error("invalid block size {block_size} for sector size {sector_size}")]
    InvalidBlockSize { block_size: u64, sector_size: u32 },
}
