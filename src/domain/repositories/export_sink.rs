//! Export sink trait
//!
//! The only write-capable handle in a session. It addresses the export
//! destination and never the medium under analysis.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when writing recovered files
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid export path: {0}")]
    InvalidPath(String),

    #[error("write beyond declared length {length}: offset {offset}")]
    OutOfBounds { offset: u64, length: u64 },

    #[error("export error: {0}")]
    Other(String),
}

/// An open destination file
pub trait ExportHandle: Send {
    /// Writes `data` at `offset` within the file
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ExportError>;

    /// Flushes and closes, returning where the file landed
    fn finish(self: Box<Self>) -> Result<PathBuf, ExportError>;
}

/// Random-access writable destination for recovered files
pub trait ExportSink: Send + Sync {
    /// Opens a new file of `length` bytes at `relative` under the
    /// destination. Existing files are never overwritten; the sink picks a
    /// free name instead.
    fn create(&self, relative: &Path, length: u64) -> Result<Box<dyn ExportHandle>, ExportError>;

    /// Returns the number of files finished so far
    fn files_written(&self) -> usize;

    /// Returns the total bytes written so far
    fn bytes_written(&self) -> u64;
}
