//! Domain entities
//!
//! Core objects of a recovery session: cached medium blocks, the
//! directory forest, carved candidates and the reconciled files.

mod cached_block;
mod carved_candidate;
mod diagnostic;
mod directory_node;
mod file_signature;
mod recovered_file;
mod session;

pub use cached_block::{CachedBlock, SourceState};
pub use carved_candidate::{CarvedCandidate, SizingOutcome};
pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use directory_node::{
    extents_from_units, AllocationStatus, DirectoryNode, Extent, FileSystemForest, NodeAttributes,
    NodeId, VolumeGeometry,
};
pub use file_signature::{
    Endian, FileSignature, FooterRule, FooterSearch, SizeField, SizeRule, StructureCheck,
};
pub use recovered_file::{ExportStatus, FragmentNote, Provenance, RecoveredFile, SourceExtent};
pub use session::{ScanPhase, ScanProgress, SessionState};
