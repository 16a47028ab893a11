//! Recovery session
//!
//! Drives one medium through detection, filesystem parsing, signature
//! carving, reconciliation and export. Every read goes through the
//! snapshot; the only write-capable handle is the export sink.

use super::dto::{RecoveryConfig, RecoveryReport};
use super::events::{EventBus, SessionEvent};
use super::export::{export_file, plan_paths, ExportFailure};
use super::reconcile::reconcile;
use crate::domain::entities::{
    CarvedCandidate, Diagnostic, DiagnosticKind, FileSystemForest, RecoveredFile, ScanPhase,
    ScanProgress, SessionState,
};
use crate::domain::repositories::{
    ByteSource, ExportSink, FileSystemError, FileSystemParser, Medium, MediumError,
};
use crate::domain::services::{ByteRangeSet, CancellationToken, CatalogError, SignatureCatalog};
use crate::infrastructure::carvers::{suppress_overlaps, SignatureCarver};
use crate::infrastructure::file_systems::{detect, Detection, VolumeParser};
use crate::infrastructure::medium::MediumReader;
use crate::infrastructure::snapshot::{ScanCursor, Snapshot, SnapshotError};
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Session-fatal errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("medium unavailable: {0}")]
    MediumUnavailable(MediumError),

    #[error("invalid request: {0}")]
    InvalidRequest(MediumError),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("signature catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

impl From<MediumError> for SessionError {
    fn from(err: MediumError) -> Self {
        match err {
            MediumError::InvalidRequest { .. } => Self::InvalidRequest(err),
            other => Self::MediumUnavailable(other),
        }
    }
}

/// Result of a phase that polls for cancellation
enum Phase<T> {
    Completed(T),
    Cancelled,
}

/// One recovery run over one medium
pub struct RecoverySession {
    config: RecoveryConfig,
    snapshot: Arc<Snapshot>,
    carver: SignatureCarver,
    sink: Arc<dyn ExportSink>,
    pool: rayon::ThreadPool,
    events: EventBus,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecoverySession {
    /// Opens a session with the built-in signature catalog
    pub fn new(
        medium: Arc<dyn Medium>,
        sink: Arc<dyn ExportSink>,
        config: RecoveryConfig,
    ) -> Result<Self, SessionError> {
        Self::with_catalog(medium, sink, config, SignatureCatalog::standard())
    }

    /// Opens a session carving with `catalog`.
    ///
    /// With a snapshot directory configured, a previous session's cache and
    /// carve progress for the same medium are picked up here.
    pub fn with_catalog(
        medium: Arc<dyn Medium>,
        sink: Arc<dyn ExportSink>,
        config: RecoveryConfig,
        mut catalog: SignatureCatalog,
    ) -> Result<Self, SessionError> {
        if !config.signature_kinds.is_empty() {
            catalog.restrict_to(&config.signature_kinds)?;
        }

        let reader = MediumReader::new(medium, config.retry);
        let snapshot = match &config.snapshot_dir {
            Some(dir) => Snapshot::open(reader, config.cache_block_size, dir)?,
            None => Snapshot::in_memory(reader, config.cache_block_size)?,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("reclaim-worker-{i}"))
            .build()?;

        info!(
            medium = %snapshot.medium_info().label,
            size = snapshot.size(),
            resumed = snapshot.is_resumed(),
            workers = pool.current_num_threads(),
            "recovery session opened"
        );

        Ok(Self {
            carver: SignatureCarver::new(Arc::new(catalog), config.min_candidate_size),
            config,
            snapshot: Arc::new(snapshot),
            sink,
            pool,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Idle),
            diagnostics: Mutex::new(Vec::new()),
        })
    }

    /// Uses `token` instead of a fresh one, so a caller can cancel through
    /// a token it already shares with other work
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Event stream for presentation code
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Token that cancels this session when tripped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Runs the session to a terminal state.
    ///
    /// Per-file problems end up in the report; only a lost medium, an
    /// invalid read request or a broken snapshot store return `Err`, after
    /// moving the session to `Failed`.
    #[instrument(skip_all, fields(medium = %self.snapshot.medium_info().label))]
    pub fn run(&self) -> Result<RecoveryReport, SessionError> {
        let from = self.state();
        if from != SessionState::Idle {
            return Err(SessionError::InvalidTransition {
                from,
                to: SessionState::ScanningFilesystem,
            });
        }

        let started = Instant::now();
        let cancel = match self.config.session_timeout() {
            Some(timeout) => self.cancel.with_deadline_after(timeout),
            None => self.cancel.clone(),
        };

        let mut report = RecoveryReport::new(
            self.snapshot.medium_info().label.clone(),
            self.snapshot.size(),
        );
        report.resumed = self.snapshot.is_resumed();

        let outcome = self.drive(&cancel, &mut report);
        report.duration = started.elapsed();
        report.diagnostics = self.diagnostics.lock().clone();

        match outcome {
            Ok(()) => {
                report.state = self.state();
                info!(
                    state = %report.state,
                    files = report.files.len(),
                    failed = report.failed().count(),
                    partial = report.partial().count(),
                    elapsed_ms = report.duration.as_millis() as u64,
                    "recovery session finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "recovery session failed");
                let _ = self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    fn drive(&self, cancel: &CancellationToken, report: &mut RecoveryReport) -> Result<(), SessionError> {
        let source: &dyn ByteSource = self.snapshot.as_ref();
        let detection = detect(source);

        let forest = match detection {
            Detection::Known { kind, .. } => {
                self.transition(SessionState::ScanningFilesystem)?;
                report.filesystem = Some(kind);
                match self.scan_filesystem(detection, cancel)? {
                    Phase::Completed(forest) => forest,
                    Phase::Cancelled => return self.transition(SessionState::Cancelled),
                }
            }
            Detection::Unknown => {
                self.diagnose(Diagnostic::new(
                    DiagnosticKind::UnsupportedFilesystem,
                    self.snapshot.medium_info().label.clone(),
                    "no FAT32 or NTFS volume found, recovering by signature only",
                ));
                None
            }
        };

        if cancel.is_cancelled() {
            return self.transition(SessionState::Cancelled);
        }
        self.transition(SessionState::ScanningSignatures)?;

        let candidates = if self.config.carve {
            let claimed = claimed_ranges(forest.as_ref());
            match self.scan_signatures(&claimed, cancel, report)? {
                Phase::Completed(candidates) => candidates,
                Phase::Cancelled => return self.transition(SessionState::Cancelled),
            }
        } else {
            debug!("signature pass disabled");
            Vec::new()
        };

        if cancel.is_cancelled() {
            return self.transition(SessionState::Cancelled);
        }
        self.transition(SessionState::Reconciling)?;
        let mut files = reconcile(forest.as_ref(), &candidates);

        self.transition(SessionState::Exporting)?;
        let finished = self.export_all(&mut files, cancel);
        report.files = files;
        if finished? {
            self.transition(SessionState::Done)
        } else {
            self.transition(SessionState::Cancelled)
        }
    }

    #[instrument(skip_all)]
    fn scan_filesystem(
        &self,
        detection: Detection,
        cancel: &CancellationToken,
    ) -> Result<Phase<Option<FileSystemForest>>, SessionError> {
        let source: &dyn ByteSource = self.snapshot.as_ref();
        let parsed = VolumeParser::open(source, detection, self.config.max_mft_records)
            .and_then(|parser| parser.map(|p| p.parse(source, cancel)).transpose());

        let forest = match parsed {
            Ok(forest) => forest,
            Err(FileSystemError::Cancelled) => return Ok(Phase::Cancelled),
            Err(FileSystemError::Medium(e)) => return Err(e.into()),
            Err(FileSystemError::InvalidBootSector(reason)) => {
                warn!(%reason, "volume rejected after detection");
                self.diagnose(Diagnostic::structural("boot sector", reason));
                None
            }
        };

        if let Some(forest) = &forest {
            for diagnostic in &forest.diagnostics {
                self.diagnose(diagnostic.clone());
            }
            info!(
                kind = %forest.kind,
                nodes = forest.nodes.len(),
                files = forest.files().count(),
                "filesystem scanned"
            );
        }
        let total = self.snapshot.size();
        self.events.emit(SessionEvent::Progress(ScanProgress {
            phase: ScanPhase::Filesystem,
            bytes_done: total,
            bytes_total: total,
        }));
        Ok(Phase::Completed(forest))
    }

    /// Carves unclaimed bytes window by window, a batch of windows at a
    /// time, recording each finished batch so a later session can resume
    #[instrument(skip_all)]
    fn scan_signatures(
        &self,
        claimed: &ByteRangeSet,
        cancel: &CancellationToken,
        report: &mut RecoveryReport,
    ) -> Result<Phase<Vec<CarvedCandidate>>, SessionError> {
        let snapshot = self.snapshot.as_ref();
        let size = snapshot.size();
        let chunk = self.config.carve_chunk_size.max(1);
        let scan_key = self.scan_key(claimed)?;

        let (mut candidates, mut position) = match snapshot.restored_progress() {
            Some((carved, cursor)) if cursor.scan_key == scan_key => {
                info!(carve_offset = cursor.carve_offset, restored = carved.len(), "resuming signature scan");
                (carved, cursor.carve_offset.min(size))
            }
            Some(_) => {
                debug!("recorded carve progress belongs to other settings, starting over");
                (Vec::new(), 0)
            }
            None => (Vec::new(), 0),
        };
        report.bytes_scanned = position;

        let batch_windows = (self.pool.current_num_threads() * 2).max(1) as u64;
        while position < size {
            if cancel.is_cancelled() {
                info!(position, "signature scan cancelled");
                return Ok(Phase::Cancelled);
            }

            let windows: Vec<Range<u64>> = (0..batch_windows)
                .map(|i| position.saturating_add(i.saturating_mul(chunk)))
                .take_while(|&start| start < size)
                .map(|start| start..start.saturating_add(chunk).min(size))
                .collect();
            let batch_end = windows.last().map_or(size, |w| w.end);

            let results: Vec<Result<Vec<CarvedCandidate>, MediumError>> = self.pool.install(|| {
                windows
                    .par_iter()
                    .map(|window| self.carver.scan_window(snapshot, window.clone(), claimed))
                    .collect()
            });
            let mut batch = Vec::new();
            for result in results {
                batch.extend(result?);
            }

            position = batch_end;
            snapshot.record_progress(
                &batch,
                &ScanCursor {
                    carve_offset: position,
                    scan_key: scan_key.clone(),
                },
            );
            candidates.extend(batch);
            report.bytes_scanned = position;
            self.events.emit(SessionEvent::Progress(ScanProgress {
                phase: ScanPhase::Signatures,
                bytes_done: position,
                bytes_total: size,
            }));
        }

        let candidates = suppress_overlaps(candidates);
        info!(candidates = candidates.len(), "signature scan complete");
        Ok(Phase::Completed(candidates))
    }

    /// Exports every file; `Ok(false)` when cancellation left some pending
    #[instrument(skip_all, fields(files = files.len()))]
    fn export_all(&self, files: &mut [RecoveredFile], cancel: &CancellationToken) -> Result<bool, SessionError> {
        let paths = plan_paths(files);
        let total: u64 = files.iter().map(RecoveredFile::size).sum();
        let done = AtomicU64::new(0);
        let fatal: Mutex<Option<MediumError>> = Mutex::new(None);
        let source: &dyn ByteSource = self.snapshot.as_ref();
        let sink = self.sink.as_ref();

        self.pool.install(|| {
            files.par_iter_mut().zip(paths.par_iter()).for_each(|(file, path)| {
                if cancel.is_cancelled() || fatal.lock().is_some() {
                    return;
                }

                match export_file(source, sink, file, path) {
                    Ok((landed, degraded)) => {
                        if !degraded.is_empty() {
                            let zeroed: u64 = degraded.iter().map(|r| r.end - r.start).sum();
                            file.add_diagnostic(Diagnostic::unreadable(
                                file.display_path(),
                                format!("{zeroed} unreadable bytes exported as zeros"),
                            ));
                        }
                        file.mark_exported(landed, degraded);
                    }
                    Err(ExportFailure::Sink(e)) => {
                        warn!(id = file.id(), path = %path.display(), error = %e, "export failed");
                        file.add_diagnostic(Diagnostic::new(
                            DiagnosticKind::ExportWriteFailure,
                            file.display_path(),
                            e.to_string(),
                        ));
                        file.mark_failed(e.to_string());
                    }
                    Err(ExportFailure::Source(e)) => {
                        fatal.lock().get_or_insert(e);
                        return;
                    }
                }

                self.events.emit(SessionEvent::FileStatus {
                    id: file.id(),
                    status: file.export_status(),
                });
                let bytes_done = done.fetch_add(file.size(), Ordering::Relaxed) + file.size();
                self.events.emit(SessionEvent::Progress(ScanProgress {
                    phase: ScanPhase::Export,
                    bytes_done,
                    bytes_total: total,
                }));
            });
        });

        if let Some(e) = fatal.into_inner() {
            return Err(e.into());
        }
        Ok(files.iter().all(|f| f.export_status().is_terminal()))
    }

    /// Digest of everything the carve output depends on besides the bytes
    fn scan_key(&self, claimed: &ByteRangeSet) -> Result<String, SessionError> {
        let mut hasher = Sha256::new();
        let catalog = self.carver.catalog();
        hasher.update(catalog.to_json()?.as_bytes());
        for kind in catalog.enabled_kinds() {
            hasher.update(kind.as_bytes());
            hasher.update([0]);
        }
        hasher.update(self.config.carve_chunk_size.to_le_bytes());
        hasher.update(self.config.min_candidate_size.to_le_bytes());
        for range in claimed.iter() {
            hasher.update(range.start.to_le_bytes());
            hasher.update(range.end.to_le_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(SessionError::InvalidTransition { from, to: next });
            }
            *state = next;
            from
        };
        info!(%from, to = %next, "session state changed");
        self.events.emit(SessionEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn diagnose(&self, diagnostic: Diagnostic) {
        debug!(%diagnostic, "session diagnostic");
        self.events.emit(SessionEvent::Diagnostic(diagnostic.clone()));
        self.diagnostics.lock().push(diagnostic);
    }
}

/// Bytes owned by filesystem-identified files
fn claimed_ranges(forest: Option<&FileSystemForest>) -> ByteRangeSet {
    let Some(forest) = forest else {
        return ByteRangeSet::new();
    };
    ByteRangeSet::from_ranges(
        forest
            .files()
            .flat_map(|node| forest.byte_ranges(node))
            .map(|(_, range)| range),
    )
}
