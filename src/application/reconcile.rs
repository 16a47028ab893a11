//! Merging filesystem and carved results
//!
//! Filesystem-identified files never share a byte: they claim storage in
//! priority order (active, orphaned, deleted; then confidence; then id) and
//! a later claimant loses the contested bytes, which export as zeros.
//! Carved candidates that touch claimed storage are not kept as files of
//! their own; they are attached as notes to the files they overlap.

use crate::domain::entities::{
    CarvedCandidate, Diagnostic, FileSystemForest, FragmentNote, Provenance, RecoveredFile,
};
use crate::domain::services::ByteRangeSet;
use std::cmp::Ordering;
use std::ops::Range;
use tracing::debug;

/// Confidence lost by a file whose storage was already claimed
const CONTESTED_PENALTY: f32 = 0.4;

/// Builds the final file set; ids follow node order, then carve order
pub fn reconcile(forest: Option<&FileSystemForest>, candidates: &[CarvedCandidate]) -> Vec<RecoveredFile> {
    let mut files: Vec<RecoveredFile> = forest
        .map(|forest| {
            forest
                .files()
                .enumerate()
                .map(|(i, node)| RecoveredFile::from_node(i as u64 + 1, forest, node))
                .collect()
        })
        .unwrap_or_default();

    let owned = resolve_contention(&mut files);

    let mut next_id = files.len() as u64 + 1;
    let mut dropped = 0usize;
    let mut ordered: Vec<&CarvedCandidate> = candidates.iter().collect();
    ordered.sort_by_key(|c| (c.byte_range.start, c.byte_range.end));

    for candidate in ordered {
        if candidate.fragments.iter().any(|f| owned.overlaps(f)) {
            dropped += 1;
            let note = FragmentNote {
                kind: candidate.kind.clone(),
                byte_range: candidate.byte_range.clone(),
            };
            for file in files
                .iter_mut()
                .filter(|f| f.provenance() == Provenance::Filesystem)
                .filter(|f| candidate.fragments.iter().any(|frag| f.overlaps(frag)))
            {
                file.add_note(note.clone());
            }
            continue;
        }
        files.push(RecoveredFile::from_candidate(next_id, candidate));
        next_id += 1;
    }

    debug!(files = files.len(), carved_dropped = dropped, "reconciled");
    files
}

/// Strips contested bytes from lower-priority filesystem files and
/// returns everything the filesystem files own afterwards
fn resolve_contention(files: &mut [RecoveredFile]) -> ByteRangeSet {
    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by(|&a, &b| claim_order(&files[a], &files[b]));

    let mut owned = ByteRangeSet::new();
    for index in order {
        let file = &mut files[index];
        let contested: Vec<Range<u64>> = file
            .extents()
            .iter()
            .flat_map(|extent| intersections(&owned, &extent.byte_range))
            .collect();

        for range in &contested {
            file.release_range(range);
        }
        if let Some(first) = contested.first() {
            let subject = file.display_path();
            file.lower_confidence(
                CONTESTED_PENALTY,
                Diagnostic::structural(
                    subject,
                    format!(
                        "{} contested range(s) starting at byte {} belong to a higher-priority file",
                        contested.len(),
                        first.start
                    ),
                ),
            );
        }

        for extent in file.extents() {
            owned.insert(extent.byte_range.clone());
        }
    }
    owned
}

fn claim_order(a: &RecoveredFile, b: &RecoveredFile) -> Ordering {
    let rank = |f: &RecoveredFile| f.allocation().map_or(u8::MAX, |s| s.priority());
    rank(a)
        .cmp(&rank(b))
        .then(b.confidence().total_cmp(&a.confidence()))
        .then(a.id().cmp(&b.id()))
}

/// Parts of `range` already present in `set`
fn intersections(set: &ByteRangeSet, range: &Range<u64>) -> Vec<Range<u64>> {
    set.iter()
        .filter(|r| r.start < range.end && range.start < r.end)
        .map(|r| r.start.max(range.start)..r.end.min(range.end))
        .collect()
}
