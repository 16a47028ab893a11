//! Repository traits (interfaces)
//!
//! These traits define the contracts for external dependencies: the
//! read-only medium, filesystem parsers and the export destination.

mod export_sink;
mod file_system;
mod medium;

pub use export_sink::{ExportError, ExportHandle, ExportSink};
pub use file_system::{FileSystemError, FileSystemKind, FileSystemParser};
pub use medium::{ByteSource, Medium, MediumError, MediumInfo, ReadOutcome};
pub(crate) use medium::push_merged;
