//! Session manifest journal
//!
//! JSON-lines file next to the snapshot image. The first line identifies
//! the medium; every later line records one cached block, one carved
//! candidate or one progress cursor. Each line is synced as soon as it
//! is written, so a crash loses at most the line being written, and a torn
//! trailing line is ignored on load.

use super::SnapshotError;
use crate::domain::entities::CarvedCandidate;
use crate::domain::repositories::MediumError;
use crate::infrastructure::medium::MediumReader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const MANIFEST_VERSION: u32 = 2;
const FINGERPRINT_PREFIX: u64 = 1_048_576;

/// Stable identity of a medium: size plus a hash of its first MiB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumIdentity {
    pub total_size: u64,
    pub sector_size: u32,
    pub fingerprint: String,
}

impl MediumIdentity {
    pub fn compute(reader: &MediumReader) -> Result<Self, MediumError> {
        let info = reader.info();
        let prefix = info.total_size.min(FINGERPRINT_PREFIX) as usize;
        let outcome = reader.read(0, prefix)?;

        let mut hasher = Sha256::new();
        hasher.update(&outcome.data);
        hasher.update(info.total_size.to_le_bytes());

        Ok(Self {
            total_size: info.total_size,
            sector_size: info.sector_size,
            fingerprint: hex::encode(hasher.finalize()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub version: u32,
    pub created_at: u64,
    pub medium: MediumIdentity,
    pub block_size: u64,
}

impl ManifestHeader {
    pub fn new(medium: MediumIdentity, block_size: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            version: MANIFEST_VERSION,
            created_at,
            medium,
            block_size,
        }
    }
}

/// Where a cached block lives in the snapshot image and how it read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub index: u64,
    pub offset: u64,
    pub length: u32,
    #[serde(default)]
    pub degraded: Vec<Range<u64>>,
    pub crc32: u32,
}

/// Carving progress: every window before `carve_offset` is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub carve_offset: u64,
    /// Digest of the catalog and carve settings the progress belongs to
    pub scan_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JournalRecord {
    Header(ManifestHeader),
    Block(BlockRecord),
    Carved {
        scan_key: String,
        candidate: CarvedCandidate,
    },
    Cursor(ScanCursor),
}

/// A journaled candidate and the scan settings that produced it
#[derive(Debug, Clone)]
struct CarvedEntry {
    scan_key: String,
    candidate: CarvedCandidate,
}

/// In-memory view of a journal
#[derive(Debug, Clone)]
pub struct SessionManifest {
    pub header: ManifestHeader,
    pub blocks: BTreeMap<u64, BlockRecord>,
    carved: Vec<CarvedEntry>,
    pub cursor: Option<ScanCursor>,
}

impl SessionManifest {
    pub fn new(header: ManifestHeader) -> Self {
        Self {
            header,
            blocks: BTreeMap::new(),
            carved: Vec::new(),
            cursor: None,
        }
    }

    /// Loads a journal; `Ok(None)` when none exists yet
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut manifest: Option<Self> = None;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    // only a torn tail is expected; stop at the first bad line
                    warn!(line = line_no + 1, error = %e, "ignoring unreadable manifest tail");
                    break;
                }
            };

            match record {
                JournalRecord::Header(header) => {
                    if manifest.is_some() {
                        return Err(SnapshotError::Manifest(format!(
                            "duplicate header at line {}",
                            line_no + 1
                        )));
                    }
                    manifest = Some(Self::new(header));
                }
                JournalRecord::Block(block) => {
                    started(&mut manifest)?.blocks.insert(block.index, block);
                }
                JournalRecord::Carved { scan_key, candidate } => {
                    started(&mut manifest)?.carved.push(CarvedEntry { scan_key, candidate })
                }
                JournalRecord::Cursor(cursor) => started(&mut manifest)?.cursor = Some(cursor),
            }
        }

        if let Some(m) = &manifest {
            if m.header.version != MANIFEST_VERSION {
                return Err(SnapshotError::Manifest(format!(
                    "unsupported manifest version {}",
                    m.header.version
                )));
            }
        }
        Ok(manifest)
    }

    /// Candidates covered by the cursor, in journal order.
    ///
    /// Only candidates carved under the cursor's scan key count; a scan
    /// restarted with other settings leaves earlier records behind.
    pub fn carved(&self) -> Vec<CarvedCandidate> {
        let Some(cursor) = &self.cursor else {
            return Vec::new();
        };
        self.carved
            .iter()
            .filter(|e| e.scan_key == cursor.scan_key)
            .filter(|e| e.candidate.header_offset() < cursor.carve_offset)
            .map(|e| e.candidate.clone())
            .collect()
    }
}

fn started(manifest: &mut Option<SessionManifest>) -> Result<&mut SessionManifest, SnapshotError> {
    manifest
        .as_mut()
        .ok_or_else(|| SnapshotError::Manifest("journal does not start with a header".into()))
}

/// Append-only writer for the journal
pub struct ManifestJournal {
    path: PathBuf,
    file: File,
}

impl ManifestJournal {
    /// Starts a fresh journal, replacing any previous one
    pub fn create(path: &Path, header: &ManifestHeader) -> Result<Self, SnapshotError> {
        let file = File::create(path)?;
        let mut journal = Self {
            path: path.to_path_buf(),
            file,
        };
        journal.append(&JournalRecord::Header(header.clone()))?;
        Ok(journal)
    }

    /// Rewrites `manifest` compactly through a temp file and an atomic
    /// rename, then reopens it for appending
    pub fn compact(path: &Path, manifest: &SessionManifest) -> Result<Self, SnapshotError> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut write = |record: &JournalRecord| -> Result<(), SnapshotError> {
                let mut line = serde_json::to_vec(record)
                    .map_err(|e| SnapshotError::Manifest(e.to_string()))?;
                line.push(b'\n');
                tmp.write_all(&line)?;
                Ok(())
            };

            write(&JournalRecord::Header(manifest.header.clone()))?;
            for block in manifest.blocks.values() {
                write(&JournalRecord::Block(block.clone()))?;
            }
            if let Some(cursor) = &manifest.cursor {
                for candidate in manifest.carved() {
                    write(&JournalRecord::Carved {
                        scan_key: cursor.scan_key.clone(),
                        candidate,
                    })?;
                }
                write(&JournalRecord::Cursor(cursor.clone()))?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        let file = OpenOptions::new().append(true).open(path)?;
        debug!(path = %path.display(), blocks = manifest.blocks.len(), "manifest compacted");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_block(&mut self, block: BlockRecord) -> Result<(), SnapshotError> {
        self.append(&JournalRecord::Block(block))
    }

    /// Records a batch of candidates followed by the cursor that covers them
    pub fn record_progress(
        &mut self,
        candidates: &[CarvedCandidate],
        cursor: &ScanCursor,
    ) -> Result<(), SnapshotError> {
        for candidate in candidates {
            self.append(&JournalRecord::Carved {
                scan_key: cursor.scan_key.clone(),
                candidate: candidate.clone(),
            })?;
        }
        self.append(&JournalRecord::Cursor(cursor.clone()))
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), SnapshotError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| SnapshotError::Manifest(e.to_string()))?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::SizingOutcome;
    use tempfile::TempDir;

    fn header() -> ManifestHeader {
        ManifestHeader::new(
            MediumIdentity {
                total_size: 1 << 20,
                sector_size: 512,
                fingerprint: "ab".repeat(32),
            },
            65_536,
        )
    }

    fn candidate(at: u64) -> CarvedCandidate {
        CarvedCandidate {
            byte_range: at..at + 100,
            kind: "gif".into(),
            extension: "gif".into(),
            confidence: 0.5,
            fragments: vec![at..at + 100],
            sizing: SizingOutcome::Footer,
        }
    }

    fn block(index: u64) -> BlockRecord {
        BlockRecord {
            index,
            offset: index * 65_536,
            length: 65_536,
            degraded: vec![],
            crc32: 7,
        }
    }

    #[test]
    fn missing_journal_loads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(SessionManifest::load(&dir.path().join("m.jsonl")).unwrap().is_none());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut journal = ManifestJournal::create(&path, &header()).unwrap();
        journal.record_block(block(3)).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record\":\"block\",\"ind").unwrap();

        let manifest = SessionManifest::load(&path).unwrap().unwrap();
        assert_eq!(manifest.header, header());
        assert_eq!(manifest.blocks.len(), 1);
        assert!(manifest.blocks.contains_key(&3));
    }

    #[test]
    fn candidates_past_the_cursor_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut journal = ManifestJournal::create(&path, &header()).unwrap();
        let cursor = ScanCursor {
            carve_offset: 4096,
            scan_key: "k".into(),
        };
        journal.record_progress(&[candidate(100)], &cursor).unwrap();
        // a crash after this line leaves a candidate without its cursor
        journal
            .append(&JournalRecord::Carved {
                scan_key: "k".into(),
                candidate: candidate(5000),
            })
            .unwrap();
        drop(journal);

        let manifest = SessionManifest::load(&path).unwrap().unwrap();
        assert_eq!(manifest.cursor, Some(cursor));
        assert_eq!(manifest.carved(), vec![candidate(100)]);
    }

    #[test]
    fn candidates_from_other_settings_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut journal = ManifestJournal::create(&path, &header()).unwrap();
        let old = ScanCursor {
            carve_offset: 8192,
            scan_key: "old".into(),
        };
        journal.record_progress(&[candidate(100)], &old).unwrap();

        // restarted from zero under new settings
        let new = ScanCursor {
            carve_offset: 4096,
            scan_key: "new".into(),
        };
        journal.record_progress(&[candidate(2000)], &new).unwrap();
        drop(journal);

        let manifest = SessionManifest::load(&path).unwrap().unwrap();
        assert_eq!(manifest.carved(), vec![candidate(2000)]);

        let path2 = dir.path().join("m2.jsonl");
        ManifestJournal::compact(&path2, &manifest).unwrap();
        let compacted = SessionManifest::load(&path2).unwrap().unwrap();
        assert_eq!(compacted.carved(), vec![candidate(2000)]);
        assert_eq!(compacted.cursor, Some(new));
    }

    #[test]
    fn compaction_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut manifest = SessionManifest::new(header());
        manifest.blocks.insert(0, block(0));
        manifest.blocks.insert(5, block(5));

        let mut journal = ManifestJournal::compact(&path, &manifest).unwrap();
        journal.record_block(block(9)).unwrap();

        let loaded = SessionManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.blocks.keys().copied().collect::<Vec<_>>(), vec![0, 5, 9]);
        assert!(loaded.cursor.is_none());
        assert!(!path.with_extension("tmp").exists());
    }
}
