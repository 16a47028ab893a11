//! Recovered file entity
//!
//! The reconciled unit a session exports: either a node identified by
//! filesystem metadata or a carved candidate.

use super::carved_candidate::CarvedCandidate;
use super::diagnostic::Diagnostic;
use super::directory_node::{AllocationStatus, DirectoryNode, FileSystemForest};
use crate::utils::format_bytes;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

/// Where a recovered file's identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Filesystem,
    Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    /// Every byte was read and written
    Complete,
    /// Written, with some ranges zero-filled
    Partial,
    Failed,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One physical piece of a recovered file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceExtent {
    /// Position of the piece inside the file
    pub logical_offset: u64,
    /// Absolute bytes on the medium
    pub byte_range: Range<u64>,
}

impl SourceExtent {
    pub fn len(&self) -> u64 {
        self.byte_range.end - self.byte_range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A carved match that overlapped this file and was folded into it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentNote {
    pub kind: String,
    pub byte_range: Range<u64>,
}

/// Represents a recovered file with its metadata and source location
#[derive(Debug, Clone)]
pub struct RecoveredFile {
    /// Unique identifier within the session
    id: u64,
    /// File name from metadata, or generated
    name: String,
    /// Directory path from metadata, slash separated
    directory: Option<String>,
    /// Extension hint for generated names
    extension: String,
    /// Signature kind for carved files
    kind: Option<String>,
    provenance: Provenance,
    allocation: Option<AllocationStatus>,
    /// Logical size in bytes
    size: u64,
    extents: Vec<SourceExtent>,
    /// Bytes whose source was lost or handed to another file
    lost_bytes: u64,
    /// Content held in metadata (NTFS resident data)
    resident: Option<Bytes>,
    /// Recovery confidence (0.0 - 1.0)
    confidence: f32,
    export_status: ExportStatus,
    failure: Option<String>,
    /// Absolute ranges that were zero-filled on export
    degraded: Vec<Range<u64>>,
    notes: Vec<FragmentNote>,
    diagnostics: Vec<Diagnostic>,
    exported_to: Option<PathBuf>,
}

impl RecoveredFile {
    /// Builds a file from a filesystem node
    pub fn from_node(id: u64, forest: &FileSystemForest, node: &DirectoryNode) -> Self {
        let extents = forest
            .byte_ranges(node)
            .into_iter()
            .map(|(logical_offset, byte_range)| SourceExtent {
                logical_offset,
                byte_range,
            })
            .collect();

        let directory = node
            .parent
            .map(|parent| forest.path_of(parent))
            .filter(|p| !p.is_empty());

        let extension = node
            .name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "bin".to_string());

        Self {
            id,
            name: node.name.clone(),
            directory,
            extension,
            kind: None,
            provenance: Provenance::Filesystem,
            allocation: Some(node.allocation),
            size: node.size_bytes,
            extents,
            lost_bytes: forest.lost_bytes(node),
            resident: node.resident.clone(),
            confidence: node.confidence.clamp(0.0, 1.0),
            export_status: ExportStatus::Pending,
            failure: None,
            degraded: Vec::new(),
            notes: Vec::new(),
            diagnostics: node.diagnostics.clone(),
            exported_to: None,
        }
    }

    /// Builds a file from a carved candidate
    pub fn from_candidate(id: u64, candidate: &CarvedCandidate) -> Self {
        let mut logical = 0;
        let extents = candidate
            .fragments
            .iter()
            .map(|f| {
                let extent = SourceExtent {
                    logical_offset: logical,
                    byte_range: f.clone(),
                };
                logical += f.end - f.start;
                extent
            })
            .collect();

        let mut file = Self {
            id,
            name: String::new(),
            directory: None,
            extension: candidate.extension.clone(),
            kind: Some(candidate.kind.clone()),
            provenance: Provenance::Signature,
            allocation: None,
            size: candidate.len(),
            extents,
            lost_bytes: 0,
            resident: None,
            confidence: candidate.confidence.clamp(0.0, 1.0),
            export_status: ExportStatus::Pending,
            failure: None,
            degraded: Vec::new(),
            notes: Vec::new(),
            diagnostics: Vec::new(),
            exported_to: None,
        };
        file.name = file.suggested_filename();
        file
    }

    /// Returns the unique ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    /// Directory and name joined, as recovered
    pub fn display_path(&self) -> String {
        match &self.directory {
            Some(dir) => format!("{}/{}", dir, self.name),
            None => self.name.clone(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn allocation(&self) -> Option<AllocationStatus> {
        self.allocation
    }

    /// Returns the size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extents(&self) -> &[SourceExtent] {
        &self.extents
    }

    pub fn resident(&self) -> Option<&Bytes> {
        self.resident.as_ref()
    }

    /// Returns the confidence level
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn export_status(&self) -> ExportStatus {
        self.export_status
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn degraded(&self) -> &[Range<u64>] {
        &self.degraded
    }

    pub fn notes(&self) -> &[FragmentNote] {
        &self.notes
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn exported_to(&self) -> Option<&PathBuf> {
        self.exported_to.as_ref()
    }

    /// Whether any source extent shares a byte with `range`
    pub fn overlaps(&self, range: &Range<u64>) -> bool {
        self.extents
            .iter()
            .any(|e| e.byte_range.start < range.end && range.start < e.byte_range.end)
    }

    /// Whether two files claim a common byte
    pub fn overlaps_file(&self, other: &RecoveredFile) -> bool {
        other.extents.iter().any(|e| self.overlaps(&e.byte_range))
    }

    /// Removes `range` from the source extents, leaving a hole that
    /// exports as zeros
    pub fn release_range(&mut self, range: &Range<u64>) {
        let mut kept = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            let r = &extent.byte_range;
            if r.end <= range.start || range.end <= r.start {
                kept.push(extent);
                continue;
            }
            self.lost_bytes += r.end.min(range.end) - r.start.max(range.start);
            if r.start < range.start {
                kept.push(SourceExtent {
                    logical_offset: extent.logical_offset,
                    byte_range: r.start..range.start,
                });
            }
            if range.end < r.end {
                kept.push(SourceExtent {
                    logical_offset: extent.logical_offset + (range.end - r.start),
                    byte_range: range.end..r.end,
                });
            }
        }
        self.extents = kept;
    }

    pub fn lower_confidence(&mut self, penalty: f32, diagnostic: Diagnostic) {
        self.confidence = (self.confidence - penalty).clamp(0.0, 1.0);
        self.diagnostics.push(diagnostic);
    }

    pub fn add_note(&mut self, note: FragmentNote) {
        self.notes.push(note);
    }

    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Bytes the extents and resident data can actually supply
    pub fn backed_bytes(&self) -> u64 {
        if let Some(resident) = &self.resident {
            return resident.len() as u64;
        }
        self.extents.iter().map(SourceExtent::len).sum()
    }

    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Records a finished export
    pub fn mark_exported(&mut self, path: PathBuf, degraded: Vec<Range<u64>>) {
        let incomplete = !degraded.is_empty() || self.lost_bytes > 0;
        self.export_status = if incomplete {
            ExportStatus::Partial
        } else {
            ExportStatus::Complete
        };
        self.degraded = degraded;
        self.exported_to = Some(path);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.export_status = ExportStatus::Failed;
        self.failure = Some(reason.into());
    }

    /// Generates a filename based on ID and kind
    pub fn suggested_filename(&self) -> String {
        format!("recovered_{:06}.{}", self.id, self.extension)
    }

    /// Returns a human-readable size string
    pub fn size_human(&self) -> String {
        format_bytes(self.size)
    }
}
