//! Cached block entity

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Whether a cached block came back whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Fresh,
    Degraded,
}

/// One aligned region of the medium, read once and immutable afterwards.
///
/// The bytes are held inline for in-memory snapshots and left out when the
/// snapshot is backed by an image file on disk.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    index: u64,
    offset: u64,
    length: u32,
    state: SourceState,
    degraded: Vec<Range<u64>>,
    checksum: u32,
    bytes: Option<Bytes>,
}

impl CachedBlock {
    /// Creates a block from freshly read data.
    ///
    /// `degraded` holds absolute ranges inside the block.
    pub fn new(index: u64, offset: u64, data: &[u8], degraded: Vec<Range<u64>>) -> Self {
        let state = if degraded.is_empty() {
            SourceState::Fresh
        } else {
            SourceState::Degraded
        };
        Self {
            index,
            offset,
            length: data.len() as u32,
            state,
            degraded,
            checksum: crc32fast::hash(data),
            bytes: None,
        }
    }

    /// Rebuilds a block from a journal entry whose bytes live in the store
    pub fn restored(
        index: u64,
        offset: u64,
        length: u32,
        degraded: Vec<Range<u64>>,
        checksum: u32,
    ) -> Self {
        let state = if degraded.is_empty() {
            SourceState::Fresh
        } else {
            SourceState::Degraded
        };
        Self {
            index,
            offset,
            length,
            state,
            degraded,
            checksum,
            bytes: None,
        }
    }

    /// Keeps the payload in memory
    pub fn with_bytes(mut self, bytes: Bytes) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn degraded(&self) -> &[Range<u64>] {
        &self.degraded
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        self.bytes.as_ref()
    }

    /// Degraded sub-ranges clipped to `range`
    pub fn degraded_within(&self, range: &Range<u64>) -> impl Iterator<Item = Range<u64>> + '_ {
        let (start, end) = (range.start, range.end);
        self.degraded.iter().filter_map(move |d| {
            let s = d.start.max(start);
            let e = d.end.min(end);
            (s < e).then_some(s..e)
        })
    }
}
