//! Carved candidate entity

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// How a candidate's length was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingOutcome {
    /// Length field inside the header
    EmbeddedSize,
    /// Footer found within the size bound
    Footer,
    /// Neither was available; the catalog default was used
    DefaultSize,
}

/// A file found by content signature alone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarvedCandidate {
    /// From the header to the end of the last fragment
    pub byte_range: Range<u64>,
    /// Catalog kind, e.g. `jpeg`
    pub kind: String,
    pub extension: String,
    pub confidence: f32,
    /// Physical pieces in logical order; one piece when contiguous
    pub fragments: Vec<Range<u64>>,
    pub sizing: SizingOutcome,
}

impl CarvedCandidate {
    pub fn header_offset(&self) -> u64 {
        self.byte_range.start
    }

    /// Logical length: sum of the fragment lengths
    pub fn len(&self) -> u64 {
        self.fragments.iter().map(|f| f.end - f.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragments.len() > 1
    }

    /// Whether any fragment shares a byte with `range`
    pub fn overlaps(&self, range: &Range<u64>) -> bool {
        self.fragments
            .iter()
            .any(|f| f.start < range.end && range.start < f.end)
    }

    pub fn overlaps_candidate(&self, other: &CarvedCandidate) -> bool {
        other.fragments.iter().any(|f| self.overlaps(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(fragments: Vec<Range<u64>>) -> CarvedCandidate {
        CarvedCandidate {
            byte_range: fragments[0].start..fragments[fragments.len() - 1].end,
            kind: "jpeg".into(),
            extension: "jpg".into(),
            confidence: 0.5,
            fragments,
            sizing: SizingOutcome::Footer,
        }
    }

    #[test]
    fn fragmented_length_skips_gaps() {
        let c = candidate(vec![0..100, 200..250]);
        assert_eq!(c.len(), 150);
        assert!(c.is_fragmented());
        assert!(!c.overlaps(&(100..200)));
        assert!(c.overlaps(&(240..300)));
    }
}
