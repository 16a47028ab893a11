//! File system parser trait
//!
//! Defines the interface for decoding filesystem metadata into a
//! directory forest, deleted and orphaned entries included.

use super::medium::{ByteSource, MediumError};
use crate::domain::entities::FileSystemForest;
use crate::domain::services::CancellationToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Supported file system types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSystemKind {
    /// Windows FAT32 filesystem
    Fat32,
    /// Windows NTFS filesystem
    Ntfs,
}

impl FileSystemKind {
    /// Returns a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            FileSystemKind::Fat32 => "FAT32",
            FileSystemKind::Ntfs => "NTFS",
        }
    }
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that stop a parse outright.
///
/// Local inconsistencies do not end up here; they become diagnostics on
/// the affected nodes.
#[derive(Error, Debug)]
pub enum FileSystemError {
    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error(transparent)]
    Medium(#[from] MediumError),

    #[error("parse cancelled")]
    Cancelled,
}

/// Trait for parsing file system metadata
///
/// A parser is bound to one volume (its boot sector is already decoded)
/// and reads only through a [`ByteSource`].
pub trait FileSystemParser: Send + Sync {
    /// The filesystem this parser understands
    fn kind(&self) -> FileSystemKind;

    /// Builds the directory forest.
    ///
    /// Traversal is single-threaded; `cancel` is polled between
    /// directories or record batches.
    fn parse(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
    ) -> Result<FileSystemForest, FileSystemError>;
}
