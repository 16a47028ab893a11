//! Local directory export sink
//!
//! Writes recovered files under an output directory with positioned
//! writes, so content can be streamed block by block in any order.

use crate::domain::repositories::{ExportError, ExportHandle, ExportSink};
use crate::infrastructure::medium::positioned::write_all_at;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Attempts at finding a free name before giving up
const MAX_NAME_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Default)]
struct Counters {
    files_written: AtomicUsize,
    bytes_written: AtomicU64,
}

/// Export sink rooted at a local directory
pub struct LocalExportSink {
    output_dir: PathBuf,
    counters: Arc<Counters>,
}

impl LocalExportSink {
    /// Creates the output directory if needed
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self, ExportError> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                ExportError::InvalidPath(format!("{}: permission denied", output_dir.display()))
            } else {
                ExportError::Io(e)
            }
        })?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Creates the file at `path`, or at `stem_N.ext` when taken
    fn create_unique(path: &Path) -> Result<(File, PathBuf), ExportError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

        let mut candidate = path.to_path_buf();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => return Ok((file, candidate)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let name = match &extension {
                        Some(ext) => format!("{stem}_{attempt}.{ext}"),
                        None => format!("{stem}_{attempt}"),
                    };
                    candidate.set_file_name(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExportError::Other(format!("no free name for {}", path.display())))
    }
}

/// Rejects absolute paths and parent references
fn validate_relative(relative: &Path) -> Result<(), ExportError> {
    let mut has_name = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            _ => return Err(ExportError::InvalidPath(relative.display().to_string())),
        }
    }
    if !has_name {
        return Err(ExportError::InvalidPath(relative.display().to_string()));
    }
    Ok(())
}

impl ExportSink for LocalExportSink {
    fn create(&self, relative: &Path, length: u64) -> Result<Box<dyn ExportHandle>, ExportError> {
        validate_relative(relative)?;
        let path = self.output_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (file, path) = Self::create_unique(&path)?;
        file.set_len(length)?;
        debug!(path = %path.display(), length, "export file created");

        Ok(Box::new(LocalExportHandle {
            file,
            path,
            length,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn files_written(&self) -> usize {
        self.counters.files_written.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.counters.bytes_written.load(Ordering::Relaxed)
    }
}

struct LocalExportHandle {
    file: File,
    path: PathBuf,
    length: u64,
    counters: Arc<Counters>,
}

impl ExportHandle for LocalExportHandle {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ExportError> {
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > self.length) {
            return Err(ExportError::OutOfBounds {
                offset,
                length: self.length,
            });
        }
        write_all_at(&self.file, data, offset)?;
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, ExportError> {
        self.file.sync_all()?;
        self.counters.files_written.fetch_add(1, Ordering::Relaxed);
        Ok(self.path)
    }
}
