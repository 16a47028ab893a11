//! Non-fatal findings attached to nodes, files and sessions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a recorded problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Sector could not be read after retries; bytes were zero-filled
    SectorUnreadable,
    /// On-disk metadata contradicts itself
    StructuralInconsistency,
    /// Writing a recovered file to the destination failed
    ExportWriteFailure,
    /// No supported filesystem was recognised
    UnsupportedFilesystem,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SectorUnreadable => "sector unreadable",
            Self::StructuralInconsistency => "structural inconsistency",
            Self::ExportWriteFailure => "export write failure",
            Self::UnsupportedFilesystem => "unsupported filesystem",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// What the finding is about: a path, a record number, a byte range
    pub subject: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn structural(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::StructuralInconsistency, subject, message)
    }

    pub fn unreadable(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::SectorUnreadable, subject, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}
