//! Sorted set of disjoint byte ranges

use std::ops::Range;

/// Disjoint, sorted, merged byte ranges.
///
/// Holds the bytes claimed by filesystem-identified files so the carver
/// can step around them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteRangeSet {
    ranges: Vec<Range<u64>>,
}

impl ByteRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = Range<u64>>>(ranges: I) -> Self {
        let mut all: Vec<Range<u64>> = ranges.into_iter().filter(|r| r.start < r.end).collect();
        all.sort_by_key(|r| (r.start, r.end));

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(all.len());
        for range in all {
            match merged.last_mut() {
                Some(last) if last.end >= range.start => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        // first range that ends at or after the new start
        let lo = self.ranges.partition_point(|r| r.end < range.start);
        // first range that starts after the new end
        let hi = self.ranges.partition_point(|r| r.start <= range.end);

        if lo == hi {
            self.ranges.insert(lo, range);
            return;
        }
        let start = range.start.min(self.ranges[lo].start);
        let end = range.end.max(self.ranges[hi - 1].end);
        self.ranges.splice(lo..hi, std::iter::once(start..end));
    }

    pub fn contains(&self, offset: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= offset);
        self.ranges.get(idx).is_some_and(|r| r.start <= offset)
    }

    pub fn overlaps(&self, range: &Range<u64>) -> bool {
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges.get(idx).is_some_and(|r| r.start < range.end)
    }

    /// First unclaimed stretch inside `from..end`, if any
    pub fn next_gap(&self, from: u64, end: u64) -> Option<Range<u64>> {
        let mut cursor = from;
        let mut idx = self.ranges.partition_point(|r| r.end <= cursor);

        while cursor < end {
            match self.ranges.get(idx) {
                Some(r) if r.start <= cursor => {
                    cursor = r.end;
                    idx += 1;
                }
                Some(r) => return Some(cursor..r.start.min(end)),
                None => return Some(cursor..end),
            }
        }
        None
    }

    /// Unclaimed stretches inside `within`
    pub fn gaps(&self, within: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = within.start;
        while let Some(gap) = self.next_gap(cursor, within.end) {
            cursor = gap.end;
            gaps.push(gap);
        }
        gaps
    }

    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }
}
