//! Snapshot cache over a medium reader

use super::block_table::BlockTable;
use super::manifest::{
    BlockRecord, ManifestHeader, ManifestJournal, MediumIdentity, ScanCursor, SessionManifest,
};
use super::{SnapshotError, IMAGE_FILE, MANIFEST_FILE};
use crate::domain::entities::{CachedBlock, CarvedCandidate};
use crate::domain::repositories::{push_merged, ByteSource, MediumError, MediumInfo, ReadOutcome};
use crate::infrastructure::medium::{positioned, MediumReader};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const FILL_STRIPES: usize = 64;

/// Where block payloads live
enum BlockStore {
    /// Payload kept inside each `CachedBlock`
    Memory,
    /// Sparse image mirroring medium offsets
    Image { file: File, path: PathBuf },
}

/// Snapshot counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub cached_blocks: u64,
    pub cache_hits: u64,
    pub blocks_filled: u64,
    pub restored_blocks: u64,
}

/// Cached, read-only view of a medium.
///
/// Blocks are filled on first touch, one writer per block; later reads of
/// a filled block go through a lock-free table.
pub struct Snapshot {
    reader: MediumReader,
    block_size: u64,
    table: BlockTable,
    fill_locks: Box<[Mutex<()>]>,
    store: BlockStore,
    journal: Mutex<Option<ManifestJournal>>,
    identity: Option<MediumIdentity>,
    restored: Option<SessionManifest>,
    cache_hits: AtomicU64,
    blocks_filled: AtomicU64,
}

impl Snapshot {
    /// Snapshot held entirely in memory; nothing survives the process
    pub fn in_memory(reader: MediumReader, block_size: u64) -> Result<Self, SnapshotError> {
        let block_size = Self::validate_block_size(block_size, reader.info())?;
        Ok(Self::assemble(reader, block_size, BlockStore::Memory, None, None, None))
    }

    /// Snapshot persisted under `dir`, resuming a previous session there
    /// when its manifest matches this medium
    pub fn open(reader: MediumReader, block_size: u64, dir: &Path) -> Result<Self, SnapshotError> {
        fs::create_dir_all(dir)?;
        let manifest_path = dir.join(MANIFEST_FILE);
        let image_path = dir.join(IMAGE_FILE);
        let identity = MediumIdentity::compute(&reader)?;

        match SessionManifest::load(&manifest_path)? {
            Some(manifest) => Self::resume(reader, identity, manifest, &manifest_path, image_path),
            None => {
                let block_size = Self::validate_block_size(block_size, reader.info())?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&image_path)?;
                file.set_len(reader.info().total_size)?;

                let header = ManifestHeader::new(identity.clone(), block_size);
                let journal = ManifestJournal::create(&manifest_path, &header)?;
                info!(dir = %dir.display(), block_size, "started new snapshot");

                Ok(Self::assemble(
                    reader,
                    block_size,
                    BlockStore::Image { file, path: image_path },
                    Some(journal),
                    Some(identity),
                    None,
                ))
            }
        }
    }

    fn resume(
        reader: MediumReader,
        identity: MediumIdentity,
        mut manifest: SessionManifest,
        manifest_path: &Path,
        image_path: PathBuf,
    ) -> Result<Self, SnapshotError> {
        if manifest.header.medium != identity {
            return Err(SnapshotError::IdentityMismatch {
                expected: identity.fingerprint,
                found: manifest.header.medium.fingerprint,
            });
        }

        let block_size = Self::validate_block_size(manifest.header.block_size, reader.info())?;
        let file = OpenOptions::new().read(true).write(true).open(&image_path)?;

        let snapshot = Self::assemble(
            reader,
            block_size,
            BlockStore::Image {
                file,
                path: image_path,
            },
            None,
            Some(identity),
            None,
        );

        let mut rejected = Vec::new();
        for record in manifest.blocks.values() {
            match snapshot.restore_block(record) {
                Ok(true) => {}
                Ok(false) => rejected.push(record.index),
                Err(e) => {
                    warn!(index = record.index, error = %e, "cached block unreadable in store");
                    rejected.push(record.index);
                }
            }
        }
        for index in &rejected {
            manifest.blocks.remove(index);
        }

        let journal = ManifestJournal::compact(manifest_path, &manifest)?;
        info!(
            restored = snapshot.table.len(),
            rejected = rejected.len(),
            cursor = manifest.cursor.as_ref().map(|c| c.carve_offset),
            "resumed snapshot"
        );

        Ok(Self {
            journal: Mutex::new(Some(journal)),
            restored: Some(manifest),
            ..snapshot
        })
    }

    fn assemble(
        reader: MediumReader,
        block_size: u64,
        store: BlockStore,
        journal: Option<ManifestJournal>,
        identity: Option<MediumIdentity>,
        restored: Option<SessionManifest>,
    ) -> Self {
        let total_blocks = reader.info().total_size.div_ceil(block_size);
        Self {
            reader,
            block_size,
            table: BlockTable::new(total_blocks),
            fill_locks: (0..FILL_STRIPES).map(|_| Mutex::new(())).collect(),
            store,
            journal: Mutex::new(journal),
            identity,
            restored,
            cache_hits: AtomicU64::new(0),
            blocks_filled: AtomicU64::new(0),
        }
    }

    fn validate_block_size(block_size: u64, info: &MediumInfo) -> Result<u64, SnapshotError> {
        let sector = info.sector_size as u64;
        if block_size == 0 || block_size % sector != 0 || block_size > u32::MAX as u64 {
            return Err(SnapshotError::InvalidBlockSize {
                block_size,
                sector_size: info.sector_size,
            });
        }
        Ok(block_size)
    }

    /// Re-admits a journaled block after checking its bytes in the store
    fn restore_block(&self, record: &BlockRecord) -> Result<bool, SnapshotError> {
        let BlockStore::Image { file, .. } = &self.store else {
            return Ok(false);
        };
        let expected_len = self.block_len(record.index);
        if record.offset != record.index * self.block_size || record.length as u64 != expected_len {
            return Ok(false);
        }

        let mut buf = vec![0u8; record.length as usize];
        positioned::read_exact_at(file, &mut buf, record.offset)?;
        if crc32fast::hash(&buf) != record.crc32 {
            warn!(index = record.index, "cached block failed checksum, will re-read");
            return Ok(false);
        }

        let block = CachedBlock::restored(
            record.index,
            record.offset,
            record.length,
            record.degraded.clone(),
            record.crc32,
        );
        Ok(self.table.insert(record.index, Arc::new(block)))
    }

    fn block_len(&self, index: u64) -> u64 {
        let offset = index * self.block_size;
        self.block_size.min(self.size().saturating_sub(offset))
    }

    /// Returns the block, reading it from the medium on first touch
    fn ensure_block(&self, index: u64) -> Result<Arc<CachedBlock>, MediumError> {
        if let Some(block) = self.table.get(index) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }

        let _guard = self.fill_locks[(index % FILL_STRIPES as u64) as usize].lock();
        if let Some(block) = self.table.get(index) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }

        let offset = index * self.block_size;
        let outcome = self.reader.read(offset, self.block_len(index) as usize)?;
        let block = CachedBlock::new(index, offset, &outcome.data, outcome.degraded.clone());

        let block = match &self.store {
            BlockStore::Memory => block.with_bytes(Bytes::from(outcome.data)),
            BlockStore::Image { file, .. } => match positioned::write_all_at(file, &outcome.data, offset) {
                Ok(()) => {
                    self.journal_block(&block);
                    block
                }
                Err(e) => {
                    warn!(index, error = %e, "snapshot store write failed, keeping block in memory");
                    block.with_bytes(Bytes::from(outcome.data))
                }
            },
        };

        let block = Arc::new(block);
        self.table.insert(index, block.clone());
        self.blocks_filled.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    fn journal_block(&self, block: &CachedBlock) {
        let mut journal = self.journal.lock();
        let Some(writer) = journal.as_mut() else {
            return;
        };
        let record = BlockRecord {
            index: block.index(),
            offset: block.offset(),
            length: block.length(),
            degraded: block.degraded().to_vec(),
            crc32: block.checksum(),
        };
        if let Err(e) = writer.record_block(record) {
            warn!(error = %e, "manifest append failed, journaling disabled for this session");
            *journal = None;
        }
    }

    /// Payload of a block
    fn block_data(&self, block: &CachedBlock) -> Result<Bytes, MediumError> {
        if let Some(bytes) = block.bytes() {
            return Ok(bytes.clone());
        }
        if let BlockStore::Image { file, path } = &self.store {
            let mut buf = vec![0u8; block.length() as usize];
            match positioned::read_exact_at(file, &mut buf, block.offset()) {
                Ok(()) => return Ok(Bytes::from(buf)),
                Err(e) => {
                    warn!(store = %path.display(), offset = block.offset(), error = %e,
                        "snapshot store read failed, reading medium directly");
                }
            }
        }
        let outcome = self.reader.read(block.offset(), block.length() as usize)?;
        Ok(Bytes::from(outcome.data))
    }

    /// Reads through the cache.
    ///
    /// Degraded ranges are those recorded when the blocks were first read.
    pub fn read(&self, offset: u64, length: usize) -> Result<ReadOutcome, MediumError> {
        let size = self.size();
        let end = offset
            .checked_add(length as u64)
            .filter(|&end| end <= size)
            .ok_or(MediumError::InvalidRequest {
                offset,
                length: length as u64,
                size,
            })?;
        if length == 0 {
            return Ok(ReadOutcome::default());
        }

        let mut data = Vec::with_capacity(length);
        let mut degraded = Vec::new();
        let first = offset / self.block_size;
        let last = (end - 1) / self.block_size;

        for index in first..=last {
            let block = self.ensure_block(index)?;
            let bytes = self.block_data(&block)?;

            let from = offset.max(block.offset());
            let to = end.min(block.end());
            let slice_start = (from - block.offset()) as usize;
            let slice_end = (to - block.offset()) as usize;
            data.extend_from_slice(&bytes[slice_start..slice_end]);

            for range in block.degraded_within(&(from..to)) {
                push_merged(&mut degraded, range);
            }
        }

        Ok(ReadOutcome { data, degraded })
    }

    /// Persists carve progress; a no-op for in-memory snapshots
    pub fn record_progress(&self, candidates: &[CarvedCandidate], cursor: &ScanCursor) {
        let mut journal = self.journal.lock();
        let Some(writer) = journal.as_mut() else {
            return;
        };
        if let Err(e) = writer.record_progress(candidates, cursor) {
            warn!(error = %e, "manifest append failed, journaling disabled for this session");
            *journal = None;
        } else {
            debug!(carve_offset = cursor.carve_offset, batch = candidates.len(), "progress recorded");
        }
    }

    /// Carve progress restored from a previous session
    pub fn restored_progress(&self) -> Option<(Vec<CarvedCandidate>, ScanCursor)> {
        let manifest = self.restored.as_ref()?;
        let cursor = manifest.cursor.clone()?;
        Some((manifest.carved(), cursor))
    }

    pub fn is_resumed(&self) -> bool {
        self.restored.is_some()
    }

    pub fn identity(&self) -> Option<&MediumIdentity> {
        self.identity.as_ref()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn medium_info(&self) -> &MediumInfo {
        self.reader.info()
    }

    pub fn reader(&self) -> &MediumReader {
        &self.reader
    }

    /// Whether `offset..offset+length` is already cached in full
    pub fn is_cached(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let first = offset / self.block_size;
        let last = (offset + length - 1) / self.block_size;
        (first..=last).all(|index| self.table.get(index).is_some())
    }

    /// Offsets of cached blocks, in order
    pub fn cached_offsets(&self) -> Vec<u64> {
        self.table.blocks().map(|b| b.offset()).collect()
    }

    pub fn stats(&self) -> SnapshotStats {
        let restored_blocks = self
            .restored
            .as_ref()
            .map(|m| m.blocks.len() as u64)
            .unwrap_or(0);
        SnapshotStats {
            cached_blocks: self.table.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            blocks_filled: self.blocks_filled.load(Ordering::Relaxed),
            restored_blocks,
        }
    }
}

impl ByteSource for Snapshot {
    fn size(&self) -> u64 {
        self.reader.info().total_size
    }

    fn sector_size(&self) -> u32 {
        self.reader.info().sector_size
    }

    fn read(&self, offset: u64, length: usize) -> Result<ReadOutcome, MediumError> {
        Snapshot::read(self, offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::medium::{MemoryMedium, RetryPolicy};
    use tempfile::TempDir;

    fn image() -> Vec<u8> {
        (0..16_384u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn reader(medium: MemoryMedium) -> (MediumReader, Arc<MemoryMedium>) {
        let medium = Arc::new(medium);
        (MediumReader::new(medium.clone(), RetryPolicy::immediate(1)), medium)
    }

    #[test]
    fn repeated_reads_hit_the_cache() {
        let (reader, medium) = reader(MemoryMedium::new(image()));
        let snapshot = Snapshot::in_memory(reader, 4096).unwrap();

        let first = snapshot.read(1000, 5000).unwrap();
        let reads = medium.read_count();
        let second = snapshot.read(1000, 5000).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.data, image()[1000..6000].to_vec());
        assert_eq!(medium.read_count(), reads);
        assert!(snapshot.is_cached(0, 8192));
        assert!(!snapshot.is_cached(8192, 1));
    }

    #[test]
    fn degraded_ranges_survive_caching() {
        let (reader, _) = reader(MemoryMedium::new(image()).with_unreadable_at(5120));
        let snapshot = Snapshot::in_memory(reader, 4096).unwrap();

        let outcome = snapshot.read(4096, 4096).unwrap();
        assert_eq!(outcome.degraded, vec![5120..5632]);
        let again = snapshot.read(5000, 200).unwrap();
        assert_eq!(again.degraded, vec![5120..5200]);
    }

    #[test]
    fn block_size_must_align_to_sectors() {
        let (reader, _) = reader(MemoryMedium::new(image()));
        assert!(matches!(
            Snapshot::in_memory(reader, 1000),
            Err(SnapshotError::InvalidBlockSize { .. })
        ));
    }

    #[test]
    fn persisted_snapshot_resumes_without_medium_reads() {
        let dir = TempDir::new().unwrap();
        {
            let (reader, _) = reader(MemoryMedium::new(image()));
            let snapshot = Snapshot::open(reader, 4096, dir.path()).unwrap();
            snapshot.read(0, 9000).unwrap();
            assert!(!snapshot.is_resumed());
        }

        let (reader, medium) = reader(MemoryMedium::new(image()));
        let snapshot = Snapshot::open(reader, 4096, dir.path()).unwrap();
        assert!(snapshot.is_resumed());
        assert_eq!(snapshot.stats().restored_blocks, 3);

        let after_identity = medium.read_count();
        let outcome = snapshot.read(0, 12_288).unwrap();
        assert_eq!(outcome.data, image()[..12_288].to_vec());
        assert_eq!(medium.read_count(), after_identity);
    }

    #[test]
    fn resume_rejects_other_medium() {
        let dir = TempDir::new().unwrap();
        {
            let (reader, _) = reader(MemoryMedium::new(image()));
            Snapshot::open(reader, 4096, dir.path()).unwrap();
        }
        let mut other = image();
        other[0] ^= 0xFF;
        let (reader, _) = reader(MemoryMedium::new(other));
        assert!(matches!(
            Snapshot::open(reader, 4096, dir.path()),
            Err(SnapshotError::IdentityMismatch { .. })
        ));
    }
}
