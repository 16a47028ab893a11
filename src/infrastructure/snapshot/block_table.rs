//! Lock-free lookup table for cached blocks
//!
//! Two levels of `OnceLock`: pages of 4096 slots are allocated on first
//! use, and each slot is written once. Readers never take a lock.

use crate::domain::entities::CachedBlock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const PAGE_BITS: u32 = 12;
const PAGE_SLOTS: usize = 1 << PAGE_BITS;
const SLOT_MASK: u64 = (PAGE_SLOTS as u64) - 1;

type Page = Box<[OnceLock<Arc<CachedBlock>>]>;

pub(crate) struct BlockTable {
    pages: Box<[OnceLock<Page>]>,
    filled: AtomicU64,
}

impl BlockTable {
    pub fn new(total_blocks: u64) -> Self {
        let page_count = total_blocks.div_ceil(PAGE_SLOTS as u64) as usize;
        Self {
            pages: (0..page_count).map(|_| OnceLock::new()).collect(),
            filled: AtomicU64::new(0),
        }
    }

    pub fn get(&self, index: u64) -> Option<&Arc<CachedBlock>> {
        let page = self.pages.get((index >> PAGE_BITS) as usize)?.get()?;
        page[(index & SLOT_MASK) as usize].get()
    }

    /// Stores `block` unless the slot is already taken.
    ///
    /// Returns false for an out-of-range index or an occupied slot.
    pub fn insert(&self, index: u64, block: Arc<CachedBlock>) -> bool {
        let Some(page) = self.pages.get((index >> PAGE_BITS) as usize) else {
            return false;
        };
        let page = page.get_or_init(|| (0..PAGE_SLOTS).map(|_| OnceLock::new()).collect());
        let stored = page[(index & SLOT_MASK) as usize].set(block).is_ok();
        if stored {
            self.filled.fetch_add(1, Ordering::Relaxed);
        }
        stored
    }

    pub fn len(&self) -> u64 {
        self.filled.load(Ordering::Relaxed)
    }

    /// Filled blocks in index order
    pub fn blocks(&self) -> impl Iterator<Item = &Arc<CachedBlock>> {
        self.pages
            .iter()
            .filter_map(|page| page.get())
            .flat_map(|page| page.iter().filter_map(|slot| slot.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_write_once() {
        let table = BlockTable::new(10_000);
        let block = Arc::new(CachedBlock::new(5000, 0, &[1, 2, 3], vec![]));
        assert!(table.get(5000).is_none());
        assert!(table.insert(5000, block.clone()));
        assert!(!table.insert(5000, block));
        assert_eq!(table.get(5000).unwrap().length(), 3);
        assert_eq!(table.len(), 1);
        assert!(!table.insert(20_000, Arc::new(CachedBlock::new(0, 0, &[], vec![]))));
        assert_eq!(table.blocks().count(), 1);
    }
}
