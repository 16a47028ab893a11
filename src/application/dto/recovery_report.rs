//! Recovery report DTO

use crate::domain::entities::{Diagnostic, ExportStatus, Provenance, RecoveredFile, SessionState};
use crate::domain::repositories::FileSystemKind;
use crate::utils::format_bytes;
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome of a recovery session
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Medium label
    pub source: String,
    /// State the session ended in
    pub state: SessionState,
    /// Filesystem recognised on the medium, if any
    pub filesystem: Option<FileSystemKind>,
    /// Every reconciled file with its export status
    pub files: Vec<RecoveredFile>,
    /// Session-level findings (file-level ones live on the files)
    pub diagnostics: Vec<Diagnostic>,
    /// Bytes covered by the signature pass
    pub bytes_scanned: u64,
    /// Medium size
    pub bytes_total: u64,
    /// Whether the snapshot resumed a previous session
    pub resumed: bool,
    pub duration: Duration,
}

impl RecoveryReport {
    pub fn new(source: impl Into<String>, bytes_total: u64) -> Self {
        Self {
            source: source.into(),
            state: SessionState::Idle,
            filesystem: None,
            files: Vec::new(),
            diagnostics: Vec::new(),
            bytes_scanned: 0,
            bytes_total,
            resumed: false,
            duration: Duration::ZERO,
        }
    }

    pub fn count_by_status(&self, status: ExportStatus) -> usize {
        self.files.iter().filter(|f| f.export_status() == status).count()
    }

    pub fn count_by_provenance(&self, provenance: Provenance) -> usize {
        self.files.iter().filter(|f| f.provenance() == provenance).count()
    }

    /// Files whose export failed
    pub fn failed(&self) -> impl Iterator<Item = &RecoveredFile> {
        self.files
            .iter()
            .filter(|f| f.export_status() == ExportStatus::Failed)
    }

    /// Files exported with zero-filled ranges or missing content
    pub fn partial(&self) -> impl Iterator<Item = &RecoveredFile> {
        self.files
            .iter()
            .filter(|f| f.export_status() == ExportStatus::Partial)
    }

    /// Total bytes of the exported files
    pub fn bytes_recovered(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| matches!(f.export_status(), ExportStatus::Complete | ExportStatus::Partial))
            .map(RecoveredFile::size)
            .sum()
    }

    /// Returns a summary string
    pub fn summary(&self) -> String {
        let mut summary = String::new();

        summary.push_str(&format!(
            "Recovery {}: {} files ({} complete, {} partial, {} failed), {}\n",
            self.state,
            self.files.len(),
            self.count_by_status(ExportStatus::Complete),
            self.count_by_status(ExportStatus::Partial),
            self.count_by_status(ExportStatus::Failed),
            format_bytes(self.bytes_recovered())
        ));

        let filesystem = self.filesystem.map_or("none", |k| k.name());
        summary.push_str(&format!(
            "Source {} ({}), filesystem {}, scanned {} in {:.2}s{}\n",
            self.source,
            format_bytes(self.bytes_total),
            filesystem,
            format_bytes(self.bytes_scanned),
            self.duration.as_secs_f64(),
            if self.resumed { ", resumed" } else { "" }
        ));

        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for file in &self.files {
            let key = match file.provenance() {
                Provenance::Filesystem => file.allocation().map_or("filesystem", |a| a.name()),
                Provenance::Signature => file.kind().unwrap_or("carved"),
            };
            *by_kind.entry(key).or_insert(0) += 1;
        }
        for (kind, count) in &by_kind {
            summary.push_str(&format!("  - {}: {}\n", kind, count));
        }

        let failed: Vec<_> = self.failed().collect();
        if !failed.is_empty() {
            summary.push_str(&format!("\n{} files failed:\n", failed.len()));
            for file in failed {
                summary.push_str(&format!(
                    "  - #{} {}: {}\n",
                    file.id(),
                    file.display_path(),
                    file.failure().unwrap_or("unknown error")
                ));
            }
        }

        let partial: Vec<_> = self.partial().collect();
        if !partial.is_empty() {
            summary.push_str(&format!("\n{} files partially recovered:\n", partial.len()));
            for file in partial {
                let zeroed: u64 = file.degraded().iter().map(|r| r.end - r.start).sum();
                summary.push_str(&format!(
                    "  - #{} {}: {} unreadable, {} of {} backed\n",
                    file.id(),
                    file.display_path(),
                    format_bytes(zeroed),
                    format_bytes(file.backed_bytes().min(file.size())),
                    format_bytes(file.size())
                ));
            }
        }

        if !self.diagnostics.is_empty() {
            summary.push_str(&format!("\n{} diagnostics recorded\n", self.diagnostics.len()));
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CarvedCandidate, SizingOutcome};
    use std::path::PathBuf;

    fn carved(id: u64) -> RecoveredFile {
        RecoveredFile::from_candidate(
            id,
            &CarvedCandidate {
                byte_range: 0..100,
                kind: "png".into(),
                extension: "png".into(),
                confidence: 0.9,
                fragments: vec![0..100],
                sizing: SizingOutcome::Footer,
            },
        )
    }

    #[test]
    fn summary_lists_failures_with_reasons() {
        let mut report = RecoveryReport::new("disk.img", 4096);
        report.state = SessionState::Done;

        let mut ok = carved(1);
        ok.mark_exported(PathBuf::from("a.png"), Vec::new());
        let mut bad = carved(2);
        bad.mark_failed("disk full");
        report.files = vec![ok, bad];

        let summary = report.summary();
        assert!(summary.starts_with("Recovery done: 2 files (1 complete, 0 partial, 1 failed)"));
        assert!(summary.contains("#2 recovered_000002.png: disk full"));
        assert!(summary.contains("  - png: 2"));
        assert_eq!(report.bytes_recovered(), 100);
    }
}
