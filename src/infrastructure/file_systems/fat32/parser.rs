//! FAT32 filesystem parser implementation
//!
//! Walks the directory tree from the root cluster, keeping deleted entries
//! and descending into deleted directories whose first cluster still looks
//! like a directory. Directory clusters the walk never reached are then
//! found by sampling the rest of the data area. Extents are rebuilt
//! afterwards in a single ownership pass so contested clusters go to live
//! files first.

use super::boot_sector::{Fat32BootSector, BOOT_SECTOR_SIZE};
use super::dir_entry::{classify, looks_like_directory_cluster, LfnAccumulator, RawEntry, ENTRY_SIZE};
use super::table::{ChainStop, ChainWalk, FatTable};
use crate::domain::entities::{
    extents_from_units, AllocationStatus, Diagnostic, DirectoryNode, FileSystemForest,
    NodeAttributes, NodeId, VolumeGeometry,
};
use crate::domain::repositories::{ByteSource, FileSystemError, FileSystemKind, FileSystemParser};
use crate::domain::services::{CancellationToken, OwnershipMap};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Owner recorded for the root directory's own clusters
const ROOT_OWNER: NodeId = NodeId(usize::MAX);

const DELETED_CONFIDENCE: f32 = 0.8;
const ORPHANED_CONFIDENCE: f32 = 0.75;
const CONTIGUOUS_GUESS_PENALTY: f32 = 0.1;
const TRUNCATION_PENALTY: f32 = 0.3;
const CROSS_LINK_PENALTY: f32 = 0.4;

const ATTR_DIRECTORY: u32 = 0x10;
/// Bytes read from each unlisted cluster before deciding to list it
const SAMPLE_BYTES: usize = 512;

/// A directory waiting to be listed
struct DirTask {
    node: Option<NodeId>,
    clusters: Vec<u64>,
    /// Listed through a deleted ancestor; live entries inside are orphans
    deleted_context: bool,
}

/// Node plus the first cluster its entry pointed at
struct Discovered {
    id: NodeId,
    first_cluster: u32,
}

/// FAT32 parser bound to one volume
pub struct Fat32Parser {
    boot: Fat32BootSector,
    volume_offset: u64,
}

impl Fat32Parser {
    /// Reads and validates the boot sector at `volume_offset`
    pub fn open(source: &dyn ByteSource, volume_offset: u64) -> Result<Self, FileSystemError> {
        let outcome = source.read(volume_offset, BOOT_SECTOR_SIZE)?;
        if outcome.is_degraded() {
            return Err(FileSystemError::InvalidBootSector(
                "FAT32 boot sector unreadable".to_string(),
            ));
        }
        let boot = Fat32BootSector::parse(&outcome.data)?;
        Ok(Self {
            boot,
            volume_offset,
        })
    }

    pub fn boot_sector(&self) -> &Fat32BootSector {
        &self.boot
    }

    pub fn volume_offset(&self) -> u64 {
        self.volume_offset
    }

    fn geometry(&self) -> VolumeGeometry {
        VolumeGeometry {
            volume_offset: self.volume_offset,
            unit_size: self.boot.cluster_size(),
            units_origin: self.volume_offset + self.boot.data_offset(),
            first_unit: 2,
            total_units: self.boot.cluster_count(),
        }
    }

    /// Reads every slot of a directory, cluster by cluster, up to the end marker
    fn read_slots(
        &self,
        source: &dyn ByteSource,
        geometry: &VolumeGeometry,
        clusters: &[u64],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<(u64, RawEntry)>, FileSystemError> {
        let mut slots = Vec::new();
        let cluster_size = geometry.unit_size as usize;

        for &cluster in clusters {
            let offset = geometry.unit_offset(cluster);
            let outcome = source.read(offset, cluster_size)?;
            if outcome.is_degraded() {
                diagnostics.push(Diagnostic::unreadable(
                    format!("directory cluster {cluster}"),
                    "unreadable sectors in directory, entries there are lost",
                ));
            }

            for (i, raw) in outcome.data.chunks_exact(ENTRY_SIZE).enumerate() {
                let at = offset + (i * ENTRY_SIZE) as u64;
                if outcome.overlaps_degraded(&(at..at + ENTRY_SIZE as u64)) {
                    continue;
                }
                match classify(raw) {
                    RawEntry::End => return Ok(slots),
                    entry => slots.push((at, entry)),
                }
            }
        }
        Ok(slots)
    }

    /// Whether `cluster` begins with a "." entry
    fn looks_like_directory(
        &self,
        source: &dyn ByteSource,
        geometry: &VolumeGeometry,
        cluster: u64,
    ) -> Result<bool, FileSystemError> {
        let outcome = source.read(geometry.unit_offset(cluster), ENTRY_SIZE)?;
        Ok(!outcome.is_degraded() && &outcome.data[..11] == b".          ")
    }

    /// Lists the tree from the root, returning the root's own clusters
    fn list_directories(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
        fat: &FatTable,
        forest: &mut FileSystemForest,
        discovered: &mut Vec<Discovered>,
        visited: &mut HashSet<u64>,
    ) -> Result<Vec<u64>, FileSystemError> {
        let root_clusters = fat
            .walk(self.boot.root_cluster, u64::MAX, &OwnershipMap::new())
            .clusters;
        visited.extend(root_clusters.iter().copied());
        let root = DirTask {
            node: None,
            clusters: root_clusters.clone(),
            deleted_context: false,
        };
        self.list_tasks(source, cancel, fat, forest, discovered, visited, vec![root])?;
        Ok(root_clusters)
    }

    /// Lists every queued directory and whatever lies beneath it, depth first
    #[allow(clippy::too_many_arguments)]
    fn list_tasks(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
        fat: &FatTable,
        forest: &mut FileSystemForest,
        discovered: &mut Vec<Discovered>,
        visited: &mut HashSet<u64>,
        mut stack: Vec<DirTask>,
    ) -> Result<(), FileSystemError> {
        let geometry = forest.geometry;
        let no_owners = OwnershipMap::new();

        while let Some(task) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(FileSystemError::Cancelled);
            }

            let slots = self.read_slots(source, &geometry, &task.clusters, &mut forest.diagnostics)?;
            let mut lfn = LfnAccumulator::default();
            let mut subdirs = Vec::new();

            for (at, slot) in slots {
                let short = match slot {
                    RawEntry::LongName(part) => {
                        lfn.push(part);
                        continue;
                    }
                    RawEntry::Skip | RawEntry::End => {
                        lfn.clear();
                        continue;
                    }
                    RawEntry::Short(short) => short,
                };

                let (long_name, first) = lfn.finish(&short);
                let name = long_name.unwrap_or_else(|| short.display_name(first));

                let allocation = if short.deleted {
                    AllocationStatus::Deleted
                } else if task.deleted_context {
                    AllocationStatus::Orphaned
                } else {
                    AllocationStatus::Active
                };

                let mut node = DirectoryNode::new(NodeId(0), name, allocation);
                node.parent = task.node;
                node.attributes = short.attributes;
                node.size_bytes = if short.attributes.directory {
                    0
                } else {
                    short.size as u64
                };
                node.record_ref = at;
                node.confidence = match allocation {
                    AllocationStatus::Active => 1.0,
                    AllocationStatus::Deleted => DELETED_CONFIDENCE,
                    AllocationStatus::Orphaned => ORPHANED_CONFIDENCE,
                };
                let id = forest.push(node);
                discovered.push(Discovered {
                    id,
                    first_cluster: short.first_cluster,
                });

                if !short.attributes.directory || !fat.in_range(short.first_cluster) {
                    continue;
                }
                let first_cluster = short.first_cluster as u64;
                if visited.contains(&first_cluster) {
                    if allocation == AllocationStatus::Active {
                        forest.diagnostics.push(Diagnostic::structural(
                            forest.path_of(id),
                            format!("directory cluster {first_cluster} already listed, not descending"),
                        ));
                    }
                    continue;
                }

                let clusters = if allocation == AllocationStatus::Active {
                    fat.walk(short.first_cluster, u64::MAX, &no_owners).clusters
                } else {
                    if !self.looks_like_directory(source, &geometry, first_cluster)? {
                        debug!(cluster = first_cluster, "deleted directory overwritten, skipping");
                        continue;
                    }
                    let walk = fat.walk(short.first_cluster, u64::MAX, &no_owners);
                    if walk.clusters.is_empty() {
                        vec![first_cluster]
                    } else {
                        walk.clusters
                    }
                };

                let clusters: Vec<u64> = clusters
                    .into_iter()
                    .take_while(|c| visited.insert(*c))
                    .collect();
                if clusters.is_empty() {
                    continue;
                }
                subdirs.push(DirTask {
                    node: Some(id),
                    clusters,
                    deleted_context: allocation != AllocationStatus::Active,
                });
            }

            // pre-order: the first subdirectory on disk is listed next
            stack.extend(subdirs.into_iter().rev());
        }

        Ok(())
    }

    /// Lists directory clusters that nothing in the tree reaches.
    ///
    /// Every data cluster outside the listed directories and the live files'
    /// chains is sampled; the ones that read like directory entries are listed
    /// under a synthetic `lost_dir_<cluster>` node. Their entries become
    /// orphaned or deleted nodes and claim clusters in the usual tiers, after
    /// everything the tree walk found.
    fn list_lost_directories(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
        fat: &FatTable,
        forest: &mut FileSystemForest,
        discovered: &mut Vec<Discovered>,
        visited: &mut HashSet<u64>,
    ) -> Result<(), FileSystemError> {
        let geometry = forest.geometry;
        let no_owners = OwnershipMap::new();
        let cluster_size = self.boot.cluster_size();
        let sample = (geometry.unit_size as usize).min(SAMPLE_BYTES);

        let mut live: HashSet<u64> = HashSet::new();
        for entry in discovered.iter() {
            let node = &forest.nodes[entry.id.0];
            if node.allocation != AllocationStatus::Active || node.is_directory() {
                continue;
            }
            let needed = node.size_bytes.div_ceil(cluster_size);
            if needed > 0 && entry.first_cluster != 0 {
                live.extend(fat.walk(entry.first_cluster, needed, &no_owners).clusters);
            }
        }

        let mut found = 0usize;
        let last = geometry.first_unit + geometry.total_units;
        for cluster in geometry.first_unit..last {
            if cancel.is_cancelled() {
                return Err(FileSystemError::Cancelled);
            }
            if visited.contains(&cluster) || live.contains(&cluster) {
                continue;
            }
            let offset = geometry.unit_offset(cluster);
            if offset.saturating_add(sample as u64) > source.size() {
                break;
            }
            let outcome = source.read(offset, sample)?;
            if outcome.is_degraded() || !looks_like_directory_cluster(&outcome.data) {
                continue;
            }

            let walk = fat.walk(cluster as u32, u64::MAX, &no_owners);
            let chain = if walk.clusters.first() == Some(&cluster) {
                walk.clusters
            } else {
                vec![cluster]
            };
            let clusters: Vec<u64> = chain.into_iter().take_while(|c| visited.insert(*c)).collect();
            if clusters.is_empty() {
                continue;
            }

            let mut holder =
                DirectoryNode::new(NodeId(0), format!("lost_dir_{cluster}"), AllocationStatus::Orphaned);
            holder.attributes = NodeAttributes::from_dos(ATTR_DIRECTORY);
            holder.record_ref = geometry.unit_offset(cluster);
            holder.confidence = ORPHANED_CONFIDENCE;
            let id = forest.push(holder);
            let before = discovered.len();

            let task = DirTask {
                node: Some(id),
                clusters,
                deleted_context: true,
            };
            self.list_tasks(source, cancel, fat, forest, discovered, visited, vec![task])?;
            debug!(cluster, entries = discovered.len() - before, "unreachable directory cluster listed");
            found += 1;
        }

        if found > 0 {
            info!(directories = found, "listed directory clusters unreachable from the root");
        }
        Ok(())
    }

    /// Rebuilds extents. Active entries claim clusters first, then orphaned
    /// ones, then deleted ones.
    fn assign_extents(
        &self,
        fat: &FatTable,
        forest: &mut FileSystemForest,
        discovered: &[Discovered],
        root_clusters: &[u64],
    ) -> OwnershipMap {
        let cluster_size = self.boot.cluster_size();
        let mut owners = OwnershipMap::new();
        for extent in extents_from_units(root_clusters) {
            owners.claim(extent.units(), ROOT_OWNER);
        }

        let (active, mut others): (Vec<&Discovered>, Vec<&Discovered>) = discovered
            .iter()
            .partition(|d| forest.nodes[d.id.0].allocation == AllocationStatus::Active);

        for entry in active {
            let node = &forest.nodes[entry.id.0];
            let needed = if node.is_directory() {
                u64::MAX
            } else {
                node.size_bytes.div_ceil(cluster_size)
            };
            if needed == 0 || entry.first_cluster == 0 {
                continue;
            }
            let walk = fat.walk(entry.first_cluster, needed, &owners);
            self.apply_walk(forest, &mut owners, entry.id, needed, walk, false);
        }

        // orphaned before deleted, then discovery order, start cluster, entry offset
        others.sort_by_key(|d| {
            let node = &forest.nodes[d.id.0];
            (node.allocation.priority(), d.id, d.first_cluster, node.record_ref)
        });

        for entry in others {
            let node = &forest.nodes[entry.id.0];
            if node.is_directory() || node.size_bytes == 0 || entry.first_cluster == 0 {
                continue;
            }
            let needed = node.size_bytes.div_ceil(cluster_size);
            let guessed = fat.is_free(entry.first_cluster);
            let walk = if guessed {
                fat.contiguous_run(entry.first_cluster, needed, &owners)
            } else {
                fat.walk(entry.first_cluster, needed, &owners)
            };
            self.apply_walk(forest, &mut owners, entry.id, needed, walk, guessed);
        }

        owners
    }

    fn apply_walk(
        &self,
        forest: &mut FileSystemForest,
        owners: &mut OwnershipMap,
        id: NodeId,
        needed: u64,
        walk: ChainWalk,
        guessed: bool,
    ) {
        let extents = extents_from_units(&walk.clusters);
        for extent in &extents {
            owners.claim(extent.units(), id);
        }

        let is_directory = forest.nodes[id.0].is_directory();
        let short = !is_directory && (walk.clusters.len() as u64) < needed;
        let problem = match walk.stop {
            ChainStop::Claimed { cluster, owner } if owner != id => {
                let holder = if owner == ROOT_OWNER {
                    "the root directory".to_string()
                } else {
                    forest.path_of(owner)
                };
                Some((
                    CROSS_LINK_PENALTY,
                    format!("cluster {cluster} is cross-linked with {holder}"),
                ))
            }
            stop if short || (!is_directory && !stop.is_clean() && !guessed) => Some((
                TRUNCATION_PENALTY,
                format!(
                    "chain ended early ({stop:?}) after {} of {needed} clusters",
                    walk.clusters.len()
                ),
            )),
            _ => None,
        };

        let path = problem.as_ref().map(|_| forest.path_of(id));
        let node = &mut forest.nodes[id.0];
        node.extents = extents;
        if guessed {
            node.confidence = (node.confidence - CONTIGUOUS_GUESS_PENALTY).max(0.0);
        }
        if let (Some((penalty, message)), Some(path)) = (problem, path) {
            debug!(path = %path, %message, "chain degraded");
            node.degrade(penalty, Diagnostic::structural(path, message));
        }
    }
}

impl FileSystemParser for Fat32Parser {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Fat32
    }

    #[instrument(skip_all, fields(volume_offset = self.volume_offset))]
    fn parse(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
    ) -> Result<FileSystemForest, FileSystemError> {
        let mut forest = FileSystemForest::new(FileSystemKind::Fat32, self.geometry());
        let fat = FatTable::load(source, &self.boot, self.volume_offset, &mut forest.diagnostics)?;

        let mut discovered = Vec::new();
        let mut visited = HashSet::new();
        let root_clusters = self.list_directories(
            source,
            cancel,
            &fat,
            &mut forest,
            &mut discovered,
            &mut visited,
        )?;
        self.list_lost_directories(source, cancel, &fat, &mut forest, &mut discovered, &mut visited)?;
        if cancel.is_cancelled() {
            return Err(FileSystemError::Cancelled);
        }
        if root_clusters.is_empty() {
            warn!(cluster = self.boot.root_cluster, "root directory chain is empty");
            forest.diagnostics.push(Diagnostic::structural(
                "root directory",
                format!("no readable chain from cluster {}", self.boot.root_cluster),
            ));
        }

        let owners = self.assign_extents(&fat, &mut forest, &discovered, &root_clusters);

        info!(
            label = %self.boot.volume_label,
            nodes = forest.nodes.len(),
            active = forest.count_by_status(AllocationStatus::Active),
            deleted = forest.count_by_status(AllocationStatus::Deleted),
            orphaned = forest.count_by_status(AllocationStatus::Orphaned),
            claimed_clusters = owners.claimed_units(),
            "FAT32 volume parsed"
        );
        Ok(forest)
    }
}
