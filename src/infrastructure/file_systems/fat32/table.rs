//! File allocation table and cluster-chain walking

use super::boot_sector::Fat32BootSector;
use crate::domain::entities::{Diagnostic, NodeId};
use crate::domain::repositories::{ByteSource, MediumError};
use crate::domain::services::OwnershipMap;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashSet;
use tracing::{debug, warn};

pub const ENTRY_MASK: u32 = 0x0FFF_FFFF;
pub const FREE: u32 = 0;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
pub const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// Why a chain walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStop {
    EndOfChain,
    /// Reached the requested cluster count
    Complete,
    OutOfRange(u32),
    Free(u32),
    /// Contiguous guess ran into a cluster allocated in the FAT
    Allocated(u32),
    BadCluster(u32),
    Cycle(u32),
    Claimed { cluster: u32, owner: NodeId },
}

impl ChainStop {
    /// Whether the chain ended the way a healthy file would
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::EndOfChain | Self::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWalk {
    pub clusters: Vec<u64>,
    pub stop: ChainStop,
}

/// In-memory copy of FAT #1, patched from later copies where it read badly
#[derive(Debug, Clone)]
pub struct FatTable {
    entries: Vec<u32>,
}

impl FatTable {
    pub fn load(
        source: &dyn ByteSource,
        boot: &Fat32BootSector,
        volume_offset: u64,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Self, MediumError> {
        let entry_count = boot.cluster_count() + 2;
        let length = (entry_count * 4).min(boot.fat_bytes());
        let fat_start = volume_offset + boot.fat_offset(0);
        let outcome = source.read(fat_start, length as usize)?;

        let mut entries: Vec<u32> = outcome
            .data
            .chunks_exact(4)
            .map(|c| LittleEndian::read_u32(c) & ENTRY_MASK)
            .collect();

        for span in &outcome.degraded {
            let rel = span.start - fat_start;
            let len = span.end - span.start;
            let mut patched = false;

            for copy in 1..boot.fat_count {
                let mirror = source.read(volume_offset + boot.fat_offset(copy) + rel, len as usize)?;
                if mirror.is_degraded() {
                    continue;
                }
                let first = (rel / 4) as usize;
                let mirrored = mirror.data.chunks_exact(4).map(|c| LittleEndian::read_u32(c) & ENTRY_MASK);
                for (entry, value) in entries.iter_mut().skip(first).zip(mirrored) {
                    *entry = value;
                }
                patched = true;
                debug!(fat_copy = copy, offset = span.start, "FAT span taken from mirror");
                break;
            }

            if !patched {
                warn!(offset = span.start, len, "FAT span unreadable in every copy");
                diagnostics.push(Diagnostic::unreadable(
                    format!("FAT bytes {}..{}", span.start, span.end),
                    "allocation entries unreadable in every FAT copy, treated as free",
                ));
            }
        }

        Ok(Self { entries })
    }

    #[cfg(test)]
    pub fn from_entries(entries: Vec<u32>) -> Self {
        Self { entries }
    }

    /// Highest valid cluster number plus one
    pub fn cluster_limit(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn in_range(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.cluster_limit()
    }

    pub fn entry(&self, cluster: u32) -> Option<u32> {
        self.entries.get(cluster as usize).copied()
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.entry(cluster) == Some(FREE)
    }

    /// Follows the chain from `start`.
    ///
    /// Stops at an end-of-chain marker, a free, bad or out-of-range
    /// cluster, a cluster visited before, a cluster owned by someone else,
    /// or after `limit` clusters. Never runs longer than the table.
    pub fn walk(&self, start: u32, limit: u64, owners: &OwnershipMap) -> ChainWalk {
        let mut clusters = Vec::new();
        let mut visited = HashSet::new();
        let mut current = start;
        let max_steps = limit.min(self.cluster_limit() as u64);

        let stop = loop {
            if clusters.len() as u64 >= max_steps {
                break ChainStop::Complete;
            }
            if !self.in_range(current) {
                break ChainStop::OutOfRange(current);
            }
            if !visited.insert(current) {
                break ChainStop::Cycle(current);
            }
            if let Some(owner) = owners.owner_of(current as u64) {
                break ChainStop::Claimed {
                    cluster: current,
                    owner,
                };
            }

            match self.entry(current).unwrap_or(FREE) {
                FREE => break ChainStop::Free(current),
                BAD_CLUSTER => break ChainStop::BadCluster(current),
                next => {
                    clusters.push(current as u64);
                    if next >= END_OF_CHAIN {
                        break ChainStop::EndOfChain;
                    }
                    current = next;
                }
            }
        };

        ChainWalk { clusters, stop }
    }

    /// Contiguous guess for a deleted file whose FAT entries were zeroed:
    /// takes clusters from `start` while they are free and unowned
    pub fn contiguous_run(&self, start: u32, count: u64, owners: &OwnershipMap) -> ChainWalk {
        let mut clusters = Vec::new();
        let mut cluster = start;

        let stop = loop {
            if clusters.len() as u64 >= count {
                break ChainStop::Complete;
            }
            if !self.in_range(cluster) {
                break ChainStop::OutOfRange(cluster);
            }
            if let Some(owner) = owners.owner_of(cluster as u64) {
                break ChainStop::Claimed { cluster, owner };
            }
            if !self.is_free(cluster) {
                break ChainStop::Allocated(cluster);
            }
            clusters.push(cluster as u64);
            cluster += 1;
        };

        ChainWalk { clusters, stop }
    }
}
