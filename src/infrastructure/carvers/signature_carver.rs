//! Signature-driven carver
//!
//! Finds headers from the catalog in a window of the snapshot and sizes
//! each hit by, in order: an embedded size field, a footer found within
//! the format's size bound, or the catalog default. Claimed ranges (bytes
//! owned by filesystem-identified files) are never used as a header and
//! are stepped over while sizing, so a candidate may come out fragmented.

use super::structure;
use crate::domain::entities::{CarvedCandidate, FileSignature, FooterRule, FooterSearch, SizingOutcome};
use crate::domain::repositories::{push_merged, ByteSource, MediumError};
use crate::domain::services::{carve_confidence, ByteRangeSet, SignatureCatalog};
use memchr::memmem;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Read granularity while walking forward from a header
const READ_CHUNK: u64 = 64 * 1024;

/// Carves candidates out of raw bytes using a signature catalog
#[derive(Debug, Clone)]
pub struct SignatureCarver {
    catalog: Arc<SignatureCatalog>,
    min_candidate_size: u64,
}

impl SignatureCarver {
    pub fn new(catalog: Arc<SignatureCatalog>, min_candidate_size: u64) -> Self {
        Self {
            catalog,
            min_candidate_size,
        }
    }

    pub fn catalog(&self) -> &SignatureCatalog {
        &self.catalog
    }

    /// Carves every header whose file start lies inside `window`.
    ///
    /// The window is read with enough overlap that a header straddling its
    /// end is still seen; the owning window is the one holding the start.
    /// Results are not yet suppressed against each other, see
    /// [`suppress_overlaps`].
    #[instrument(skip_all, fields(start = window.start, end = window.end))]
    pub fn scan_window(
        &self,
        source: &dyn ByteSource,
        window: Range<u64>,
        claimed: &ByteRangeSet,
    ) -> Result<Vec<CarvedCandidate>, MediumError> {
        let size = source.size();
        let end = window.end.min(size);
        if window.start >= end {
            return Ok(Vec::new());
        }

        let overlap = self.catalog.max_header_reach().saturating_sub(1) as u64;
        let read_end = (end + overlap).min(size);
        let buffer = source.read(window.start, (read_end - window.start) as usize)?;

        let mut candidates = Vec::new();
        for (relative, signature) in self.catalog.find_all_matches_with_offsets(&buffer.data) {
            let start = window.start + relative as u64;
            if start >= end {
                break;
            }
            let header_end = start + (signature.header_offset + signature.header.len()) as u64;
            if claimed.overlaps(&(start..header_end)) {
                trace!(start, kind = %signature.kind, "header inside claimed bytes");
                continue;
            }

            let candidate = self.carve_at(source, start, signature, claimed)?;
            if candidate.len() < self.min_candidate_size {
                trace!(start, kind = %signature.kind, len = candidate.len(), "candidate below minimum size");
                continue;
            }
            candidates.push(candidate);
        }

        if !candidates.is_empty() {
            debug!(count = candidates.len(), "window carved");
        }
        Ok(candidates)
    }

    /// Lazy scan over `source` in windows of `chunk` bytes
    pub fn scan<'a>(
        &'a self,
        source: &'a dyn ByteSource,
        claimed: &'a ByteRangeSet,
        chunk: u64,
    ) -> CarveScan<'a> {
        CarveScan {
            carver: self,
            source,
            claimed,
            chunk: chunk.max(1),
            position: 0,
            end: source.size(),
        }
    }

    /// Scans the whole source and returns the suppressed candidate set
    pub fn carve_all(
        &self,
        source: &dyn ByteSource,
        claimed: &ByteRangeSet,
        chunk: u64,
    ) -> Result<Vec<CarvedCandidate>, MediumError> {
        let mut all = Vec::new();
        for window in self.scan(source, claimed, chunk) {
            all.extend(window?);
        }
        Ok(suppress_overlaps(all))
    }

    fn carve_at(
        &self,
        source: &dyn ByteSource,
        start: u64,
        signature: &FileSignature,
        claimed: &ByteRangeSet,
    ) -> Result<CarvedCandidate, MediumError> {
        let mut stream = ExtentStream::new(source, claimed, start);
        let (length, sizing) = measure(&mut stream, signature)?;

        let verdict = match signature.structure {
            Some(check) => {
                stream.fill(length)?;
                let end = (length as usize).min(stream.data.len());
                Some(structure::verify(check, &stream.data[..end]))
            }
            None => None,
        };

        let fragments = stream.fragments_for(length);
        let byte_range = start..fragments.last().map_or(start, |f| f.end);
        Ok(CarvedCandidate {
            byte_range,
            kind: signature.kind.clone(),
            extension: signature.extension.clone(),
            confidence: carve_confidence(signature.specificity(), sizing, verdict),
            fragments,
            sizing,
        })
    }
}

/// Decides a candidate's logical length
fn measure(
    stream: &mut ExtentStream<'_>,
    signature: &FileSignature,
) -> Result<(u64, SizingOutcome), MediumError> {
    let header_len = (signature.header_offset + signature.header.len()) as u64;

    if let Some(rule) = &signature.size_rule {
        stream.fill(rule.span() as u64)?;
        if let Some(size) = rule.evaluate(&stream.data)
            && size >= header_len
            && size <= signature.max_size
        {
            stream.fill(size)?;
            return Ok((size.min(stream.len()), SizingOutcome::EmbeddedSize));
        }
    }

    if let Some(footer) = &signature.footer
        && let Some(end) = find_footer(stream, footer, header_len, signature.max_size)?
    {
        return Ok((end, SizingOutcome::Footer));
    }

    stream.fill(signature.default_size)?;
    Ok((stream.len().min(signature.default_size), SizingOutcome::DefaultSize))
}

/// Logical end of the file (footer plus trailer) if the footer appears
/// after the header and within `max_size`
fn find_footer(
    stream: &mut ExtentStream<'_>,
    footer: &FooterRule,
    header_len: u64,
    max_size: u64,
) -> Result<Option<u64>, MediumError> {
    let needle = footer.bytes.as_slice();
    if needle.is_empty() {
        return Ok(None);
    }

    let found = match footer.search {
        FooterSearch::First => {
            let finder = memmem::Finder::new(needle);
            let mut from = header_len as usize;
            loop {
                let target = (stream.len() + READ_CHUNK).min(max_size);
                stream.fill(target)?;
                let hit = stream
                    .data
                    .get(from..)
                    .and_then(|tail| finder.find(tail))
                    .map(|pos| from + pos);
                if hit.is_some() || stream.len() >= max_size || stream.exhausted {
                    break hit;
                }
                from = from.max((stream.data.len() + 1).saturating_sub(needle.len()));
            }
        }
        FooterSearch::Last => {
            stream.fill(max_size)?;
            let from = header_len as usize;
            stream
                .data
                .get(from..)
                .and_then(|tail| memmem::rfind(tail, needle))
                .map(|pos| from + pos)
        }
    };

    let Some(pos) = found else {
        return Ok(None);
    };
    let end = (pos + needle.len()) as u64;
    let end = (end + footer.trailer).min(max_size);
    stream.fill(end)?;
    Ok(Some(end.min(stream.len())))
}

/// Unclaimed bytes from a header onward, read lazily in logical order
struct ExtentStream<'a> {
    source: &'a dyn ByteSource,
    claimed: &'a ByteRangeSet,
    cursor: u64,
    data: Vec<u8>,
    /// Physical ranges behind `data`, in order
    fragments: Vec<Range<u64>>,
    exhausted: bool,
}

impl<'a> ExtentStream<'a> {
    fn new(source: &'a dyn ByteSource, claimed: &'a ByteRangeSet, start: u64) -> Self {
        Self {
            source,
            claimed,
            cursor: start,
            data: Vec::new(),
            fragments: Vec::new(),
            exhausted: false,
        }
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Reads until `target` logical bytes are held or the source runs out
    fn fill(&mut self, target: u64) -> Result<(), MediumError> {
        let size = self.source.size();
        while self.len() < target && !self.exhausted {
            let Some(gap) = self.claimed.next_gap(self.cursor, size) else {
                self.exhausted = true;
                break;
            };
            let want = (target - self.len()).min(gap.end - gap.start).min(READ_CHUNK);
            let outcome = self.source.read(gap.start, want as usize)?;
            self.data.extend_from_slice(&outcome.data);
            push_merged(&mut self.fragments, gap.start..gap.start + want);
            self.cursor = gap.start + want;
        }
        Ok(())
    }

    /// Physical ranges covering the first `length` logical bytes
    fn fragments_for(&self, length: u64) -> Vec<Range<u64>> {
        let mut remaining = length;
        let mut out = Vec::new();
        for fragment in &self.fragments {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(fragment.end - fragment.start);
            out.push(fragment.start..fragment.start + take);
            remaining -= take;
        }
        out
    }
}

/// Keeps the best candidate wherever candidates overlap.
///
/// Candidates are taken greedily by confidence (higher first), then by
/// start, then by length; anything sharing a byte with an accepted
/// candidate is dropped. The result is sorted by start.
pub fn suppress_overlaps(mut candidates: Vec<CarvedCandidate>) -> Vec<CarvedCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.byte_range.start.cmp(&b.byte_range.start))
            .then(b.len().cmp(&a.len()))
            .then(a.kind.cmp(&b.kind))
    });

    let mut taken = ByteRangeSet::new();
    let mut kept = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.fragments.iter().any(|f| taken.overlaps(f)) {
            continue;
        }
        for fragment in &candidate.fragments {
            taken.insert(fragment.clone());
        }
        kept.push(candidate);
    }

    kept.sort_by_key(|c| (c.byte_range.start, c.byte_range.end));
    kept
}

/// Restartable window-by-window scan.
///
/// Each item is the unsuppressed candidates of one window. After a fatal
/// medium error the scan yields the error once and then ends.
pub struct CarveScan<'a> {
    carver: &'a SignatureCarver,
    source: &'a dyn ByteSource,
    claimed: &'a ByteRangeSet,
    chunk: u64,
    position: u64,
    end: u64,
}

impl CarveScan<'_> {
    /// Continues from a previously recorded position
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.position = offset.min(self.end);
        self
    }

    /// Offset of the next window to scan
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for CarveScan<'_> {
    type Item = Result<Vec<CarvedCandidate>, MediumError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let window = self.position..(self.position + self.chunk).min(self.end);
        match self.carver.scan_window(self.source, window.clone(), self.claimed) {
            Ok(candidates) => {
                self.position = window.end;
                Some(Ok(candidates))
            }
            Err(err) => {
                self.position = self.end;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::carvers::structure::tests::jpeg_bytes;
    use crate::infrastructure::medium::{MediumReader, MemoryMedium, RetryPolicy};
    use proptest::prelude::*;

    fn reader(image: Vec<u8>) -> MediumReader {
        MediumReader::new(Arc::new(MemoryMedium::new(image)), RetryPolicy::immediate(0))
    }

    fn carver() -> SignatureCarver {
        SignatureCarver::new(Arc::new(SignatureCatalog::standard()), 64)
    }

    fn image_with(at: u64, file: &[u8], len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len];
        image[at as usize..at as usize + file.len()].copy_from_slice(file);
        image
    }

    #[test]
    fn jpeg_with_footer_is_one_candidate() {
        let source = reader(image_with(4096, &jpeg_bytes(500), 64 * 1024));
        let found = carver().carve_all(&source, &ByteRangeSet::new(), 16 * 1024).unwrap();

        assert_eq!(found.len(), 1);
        let jpeg = &found[0];
        assert_eq!(jpeg.kind, "jpeg");
        assert_eq!(jpeg.byte_range, 4096..4596);
        assert_eq!(jpeg.sizing, SizingOutcome::Footer);
        assert!(!jpeg.is_fragmented());
        assert!((jpeg.confidence - 0.8125).abs() < 1e-6);
    }

    #[test]
    fn header_straddling_a_window_is_found_once() {
        let source = reader(image_with(4094, &jpeg_bytes(300), 16 * 1024));
        let carver = carver();
        let claimed = ByteRangeSet::new();
        let scan = carver.scan(&source, &claimed, 4096);
        let windows: Vec<Vec<CarvedCandidate>> = scan.map(Result::unwrap).collect();

        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].len(), 1);
        assert_eq!(windows[0][0].byte_range, 4094..4394);
        assert!(windows[1..].iter().all(Vec::is_empty));
    }

    #[test]
    fn claimed_header_is_skipped() {
        let source = reader(image_with(4096, &jpeg_bytes(500), 16 * 1024));
        let claimed = ByteRangeSet::from_ranges([4096..8192]);
        assert!(carver().carve_all(&source, &claimed, 4096).unwrap().is_empty());
    }

    #[test]
    fn claimed_bytes_split_the_extent() {
        let jpeg = jpeg_bytes(500);
        let mut image = vec![0u8; 16 * 1024];
        // first 104 bytes, a 100-byte claimed hole, then the rest
        image[4096..4200].copy_from_slice(&jpeg[..104]);
        image[4300..4696].copy_from_slice(&jpeg[104..]);
        let source = reader(image);
        let claimed = ByteRangeSet::from_ranges([4200..4300]);

        let found = carver().carve_all(&source, &claimed, 4096).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fragments, vec![4096..4200, 4300..4696]);
        assert_eq!(found[0].len(), 500);
        assert_eq!(found[0].sizing, SizingOutcome::Footer);
    }

    #[test]
    fn small_candidates_are_dropped() {
        let source = reader(image_with(512, &jpeg_bytes(40), 4096));
        assert!(carver().carve_all(&source, &ByteRangeSet::new(), 4096).unwrap().is_empty());
    }

    #[test]
    fn embedded_size_wins_over_default() {
        let mut bmp = vec![0u8; 200];
        bmp[..2].copy_from_slice(b"BM");
        bmp[2..6].copy_from_slice(&200u32.to_le_bytes());
        bmp[10..14].copy_from_slice(&54u32.to_le_bytes());
        bmp[14..18].copy_from_slice(&40u32.to_le_bytes());
        let source = reader(image_with(1024, &bmp, 8192));

        let found = carver().carve_all(&source, &ByteRangeSet::new(), 4096).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, "bmp");
        assert_eq!(found[0].byte_range, 1024..1224);
        assert_eq!(found[0].sizing, SizingOutcome::EmbeddedSize);
    }

    #[test]
    fn missing_footer_falls_back_to_default_size() {
        let mut jpeg = jpeg_bytes(300);
        jpeg.truncate(298);
        let source = reader(image_with(0, &jpeg, 8192));

        let found = carver().carve_all(&source, &ByteRangeSet::new(), 4096).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sizing, SizingOutcome::DefaultSize);
        // default exceeds the medium, so the candidate runs to its end
        assert_eq!(found[0].byte_range, 0..8192);
    }

    #[test]
    fn suppression_prefers_confidence() {
        let make = |range: Range<u64>, confidence: f32| CarvedCandidate {
            byte_range: range.clone(),
            kind: "jpeg".into(),
            extension: "jpg".into(),
            confidence,
            fragments: vec![range],
            sizing: SizingOutcome::Footer,
        };
        let kept = suppress_overlaps(vec![make(0..1000, 0.4), make(100..300, 0.8), make(1000..1200, 0.3)]);
        let ranges: Vec<_> = kept.iter().map(|c| c.byte_range.clone()).collect();
        assert_eq!(ranges, vec![100..300, 1000..1200]);
    }

    #[test]
    fn restart_continues_from_position() {
        let image = image_with(9000, &jpeg_bytes(200), 16 * 1024);
        let source = reader(image);
        let claimed = ByteRangeSet::new();
        let carver = carver();

        let mut scan = carver.scan(&source, &claimed, 4096);
        assert!(scan.next().unwrap().unwrap().is_empty());
        let position = scan.position();
        assert_eq!(position, 4096);

        let resumed: Vec<CarvedCandidate> = carver
            .scan(&source, &claimed, 4096)
            .starting_at(position)
            .flat_map(Result::unwrap)
            .collect();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].byte_range.start, 9000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn carving_is_idempotent(
            noise in proptest::collection::vec(any::<u8>(), 4096..8192),
            offsets in proptest::collection::vec(0usize..3500, 0..4),
        ) {
            let mut image = noise;
            for &offset in &offsets {
                let jpeg = jpeg_bytes(300);
                let end = (offset + jpeg.len()).min(image.len());
                image[offset..end].copy_from_slice(&jpeg[..end - offset]);
            }
            let source = reader(image);
            let claimed = ByteRangeSet::new();
            let carver = carver();

            let first = carver.carve_all(&source, &claimed, 1024).unwrap();
            let second = carver.carve_all(&source, &claimed, 1024).unwrap();
            prop_assert_eq!(&first, &second);
            for pair in first.windows(2) {
                prop_assert!(!pair[0].overlaps_candidate(&pair[1]));
            }
        }
    }
}
