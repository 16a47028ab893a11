//! Interrupted sessions resumed from a persisted snapshot

mod common;

use common::*;
use reclaim::application::dto::RecoveryConfig;
use reclaim::application::{RecoverySession, SessionError};
use reclaim::domain::entities::{ExportStatus, RecoveredFile, SessionState};
use reclaim::infrastructure::medium::MemoryMedium;
use reclaim::infrastructure::persistence::LocalExportSink;
use reclaim::infrastructure::snapshot::SnapshotError;
use rstest::rstest;
use std::ops::Range;
use std::sync::Arc;

const IMAGE_SIZE: usize = 256 * 1024;
const JPEGS: [usize; 4] = [4096, 40_000, 100_000, 200_000];

type FileKey = (u64, Option<String>, Vec<Range<u64>>, u64, ExportStatus);

fn keys(files: &[RecoveredFile]) -> Vec<FileKey> {
    files
        .iter()
        .map(|f| {
            (
                f.id(),
                f.kind().map(str::to_string),
                f.extents().iter().map(|e| e.byte_range.clone()).collect(),
                f.size(),
                f.export_status(),
            )
        })
        .collect()
}

fn session(medium: Arc<MemoryMedium>, config: RecoveryConfig) -> (RecoverySession, tempfile::TempDir) {
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(LocalExportSink::new(out.path()).unwrap());
    (RecoverySession::new(medium, sink, config).unwrap(), out)
}

fn base_config() -> RecoveryConfig {
    test_config().with_worker_threads(1)
}

#[rstest]
#[case::same_settings(8192)]
#[case::changed_chunk_size(16_384)]
fn resumed_session_matches_uninterrupted_run(#[case] resumed_chunk: u64) {
    let image = image_with_jpegs(IMAGE_SIZE, &JPEGS, 500);
    let snapshot_dir = tempfile::tempdir().unwrap();

    // unplugged part-way through the signature pass
    let flaky = Arc::new(MemoryMedium::new(image.clone()).with_disconnect_after(12));
    let (first, _out) = session(flaky, base_config().with_snapshot_dir(snapshot_dir.path()));
    let err = first.run().unwrap_err();
    assert!(matches!(err, SessionError::MediumUnavailable(_)), "{err}");
    assert_eq!(first.state(), SessionState::Failed);
    drop(first);

    let replugged = Arc::new(MemoryMedium::new(image.clone()));
    let config = base_config()
        .with_snapshot_dir(snapshot_dir.path())
        .with_carve_chunk_size(resumed_chunk);
    let (second, _out) = session(replugged.clone(), config);
    let resumed = second.run().unwrap();
    assert!(resumed.resumed);
    assert_eq!(resumed.state, SessionState::Done);

    let fresh_medium = Arc::new(MemoryMedium::new(image));
    let (third, _out) = session(fresh_medium.clone(), base_config());
    let fresh = third.run().unwrap();

    assert_eq!(fresh.files.len(), JPEGS.len());
    assert_eq!(keys(&resumed.files), keys(&fresh.files));
    // blocks cached before the disconnect are not read again
    assert!(replugged.read_count() < fresh_medium.read_count());
}

#[rstest]
fn snapshot_of_another_medium_is_rejected() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let config = base_config().with_snapshot_dir(snapshot_dir.path());

    let original = Arc::new(MemoryMedium::new(image_with_jpegs(IMAGE_SIZE, &[4096], 500)));
    let (first, _out) = session(original, config.clone());
    first.run().unwrap();
    drop(first);

    let other = Arc::new(MemoryMedium::new(image_with_jpegs(IMAGE_SIZE, &[8192], 500)));
    let out = tempfile::tempdir().unwrap();
    let sink = Arc::new(LocalExportSink::new(out.path()).unwrap());
    let result = RecoverySession::new(other, sink, config);
    assert!(matches!(
        result,
        Err(SessionError::Snapshot(SnapshotError::IdentityMismatch { .. }))
    ));
}

#[rstest]
fn completed_snapshot_serves_every_read() {
    let image = image_with_jpegs(IMAGE_SIZE, &JPEGS, 500);
    let snapshot_dir = tempfile::tempdir().unwrap();
    let config = base_config().with_snapshot_dir(snapshot_dir.path());

    let (first, _out) = session(Arc::new(MemoryMedium::new(image.clone())), config.clone());
    let before = first.run().unwrap();
    drop(first);

    let medium = Arc::new(MemoryMedium::new(image));
    let (second, _out) = session(medium.clone(), config);
    let after = second.run().unwrap();

    assert_eq!(keys(&before.files), keys(&after.files));
    // only the identity fingerprint touches the medium
    assert_eq!(medium.read_count(), 1);
    assert!(second.snapshot().stats().cache_hits > 0);
}

fn run_kinds(snapshot_dir: &std::path::Path, config: RecoveryConfig) -> Vec<Option<String>> {
    let medium = Arc::new(MemoryMedium::new(image_with_jpegs(IMAGE_SIZE, &[4096], 500)));
    let (session, _out) = session(medium, config.with_snapshot_dir(snapshot_dir));
    let report = session.run().unwrap();
    assert_eq!(report.state, SessionState::Done);
    report.files.iter().map(|f| f.kind().map(str::to_string)).collect()
}

#[rstest]
fn changed_signature_kinds_are_not_served_from_old_progress() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let jpeg = Some("jpeg".to_string());

    assert_eq!(run_kinds(snapshot_dir.path(), base_config()), vec![jpeg.clone()]);
    let png_only = || base_config().with_signature_kinds(["png"]);
    assert!(run_kinds(snapshot_dir.path(), png_only()).is_empty());
    assert!(run_kinds(snapshot_dir.path(), png_only()).is_empty());
    assert_eq!(run_kinds(snapshot_dir.path(), base_config()), vec![jpeg]);
}

#[rstest]
fn restarted_scan_does_not_revive_earlier_candidates() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let strict = || base_config().with_min_candidate_size(1000);

    assert_eq!(run_kinds(snapshot_dir.path(), base_config()).len(), 1);
    assert!(run_kinds(snapshot_dir.path(), strict()).is_empty());
    assert!(run_kinds(snapshot_dir.path(), strict()).is_empty());
}
