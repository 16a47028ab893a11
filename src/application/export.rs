//! Writing recovered files to the export sink

use crate::domain::entities::{Provenance, RecoveredFile};
use crate::domain::repositories::{push_merged, ByteSource, ExportError, ExportSink, MediumError};
use crate::utils::sanitize_component;
use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes moved per read/write pair
const EXPORT_CHUNK: u64 = 1 << 20;

#[derive(Error, Debug)]
pub enum ExportFailure {
    /// Reading the source failed in a way that ends the session
    #[error(transparent)]
    Source(#[from] MediumError),

    /// Only this file is lost
    #[error(transparent)]
    Sink(#[from] ExportError),
}

/// Destination paths, one per file, unique within the session.
///
/// Metadata-identified files keep their recovered directory structure
/// under `filesystem/<status>/`; carved files go to
/// `carved/<kind>/recovered_<id>.<ext>`.
pub fn plan_paths(files: &[RecoveredFile]) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    files
        .iter()
        .map(|file| {
            let path = match file.provenance() {
                Provenance::Filesystem => filesystem_path(file),
                Provenance::Signature => carved_path(file),
            };
            if taken.insert(path.to_string_lossy().to_lowercase()) {
                return path;
            }
            let unique = with_id_suffix(&path, file.id());
            taken.insert(unique.to_string_lossy().to_lowercase());
            unique
        })
        .collect()
}

fn filesystem_path(file: &RecoveredFile) -> PathBuf {
    let status = file.allocation().map_or("unknown", |a| a.name());
    let mut path = PathBuf::from("filesystem").join(status);
    if let Some(directory) = file.directory() {
        for part in directory.split('/').filter(|p| !p.is_empty()) {
            path.push(sanitize_component(part));
        }
    }
    let name = if file.name().is_empty() {
        file.suggested_filename()
    } else {
        sanitize_component(file.name())
    };
    path.push(name);
    path
}

fn carved_path(file: &RecoveredFile) -> PathBuf {
    let kind = sanitize_component(file.kind().unwrap_or("unknown"));
    PathBuf::from("carved").join(kind).join(file.suggested_filename())
}

/// `name.ext` becomes `name_<id>.ext`
fn with_id_suffix(path: &Path, id: u64) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{id}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{id}"),
    };
    path.with_file_name(name)
}

/// Streams one file's content into the sink.
///
/// Returns where it landed and the absolute ranges that were zero-filled,
/// either because sectors were unreadable or because the extent lies past
/// the end of the medium.
pub fn export_file(
    source: &dyn ByteSource,
    sink: &dyn ExportSink,
    file: &RecoveredFile,
    path: &Path,
) -> Result<(PathBuf, Vec<Range<u64>>), ExportFailure> {
    let size = file.size();
    let mut handle = sink.create(path, size)?;
    let mut degraded = Vec::new();

    if let Some(resident) = file.resident() {
        let len = (resident.len() as u64).min(size) as usize;
        handle.write_at(0, &resident[..len])?;
        return Ok((handle.finish()?, degraded));
    }

    let medium_end = source.size();
    for extent in file.extents() {
        let range = &extent.byte_range;
        if extent.logical_offset >= size {
            continue;
        }
        let usable_end = range.end.min(range.start + (size - extent.logical_offset));
        let readable_end = usable_end.min(medium_end);
        if readable_end < usable_end {
            push_merged(&mut degraded, readable_end.max(range.start)..usable_end);
        }

        let mut offset = range.start;
        while offset < readable_end {
            let len = (readable_end - offset).min(EXPORT_CHUNK);
            let outcome = source.read(offset, len as usize)?;
            let logical = extent.logical_offset + (offset - range.start);
            handle.write_at(logical, &outcome.data)?;
            for bad in outcome.degraded {
                push_merged(&mut degraded, bad);
            }
            offset += len;
        }
    }

    degraded.sort_by_key(|r| r.start);
    Ok((handle.finish()?, degraded))
}
