//! Directory tree produced by filesystem parsers
//!
//! Nodes live in an arena (`FileSystemForest::nodes`) and refer to each
//! other by index, so parents and children never hold references.

use super::Diagnostic;
use crate::domain::repositories::FileSystemKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

/// Index of a node inside its forest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Allocation state recovered from metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Still allocated
    Active,
    /// Marked deleted in metadata
    Deleted,
    /// Deleted or detached from its parent, but content looks intact
    Orphaned,
}

impl AllocationStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Orphaned => "orphaned",
        }
    }

    /// Lower ranks win contested storage
    pub fn priority(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Orphaned => 1,
            Self::Deleted => 2,
        }
    }
}

/// A run of allocation units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start_unit: u64,
    pub unit_count: u64,
    /// Sparse runs have no storage and read back as zeros
    pub sparse: bool,
    /// Set on holes standing in for clusters the node lost, as opposed to
    /// holes the filesystem recorded
    #[serde(default)]
    pub lost: bool,
}

impl Extent {
    pub fn new(start_unit: u64, unit_count: u64) -> Self {
        Self {
            start_unit,
            unit_count,
            sparse: false,
            lost: false,
        }
    }

    pub fn sparse(unit_count: u64) -> Self {
        Self {
            start_unit: 0,
            unit_count,
            sparse: true,
            lost: false,
        }
    }

    /// A hole where the node's clusters could not be kept
    pub fn lost(unit_count: u64) -> Self {
        Self {
            lost: true,
            ..Self::sparse(unit_count)
        }
    }

    pub fn end_unit(&self) -> u64 {
        self.start_unit.saturating_add(self.unit_count)
    }

    pub fn units(&self) -> Range<u64> {
        self.start_unit..self.end_unit()
    }
}

/// Compresses an ordered unit list into runs
pub fn extents_from_units(units: &[u64]) -> Vec<Extent> {
    let mut extents: Vec<Extent> = Vec::new();
    for &unit in units {
        match extents.last_mut() {
            Some(last) if !last.sparse && last.end_unit() == unit => last.unit_count += 1,
            _ => extents.push(Extent::new(unit, 1)),
        }
    }
    extents
}

/// Attribute flags common to FAT and NTFS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub directory: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub system: bool,
    /// Raw attribute word as stored on disk
    pub raw: u32,
}

impl NodeAttributes {
    /// Decodes the DOS attribute bits shared by FAT entries and NTFS
    /// standard information
    pub fn from_dos(raw: u32) -> Self {
        Self {
            read_only: raw & 0x01 != 0,
            hidden: raw & 0x02 != 0,
            system: raw & 0x04 != 0,
            directory: raw & 0x10 != 0,
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub attributes: NodeAttributes,
    pub allocation: AllocationStatus,
    pub size_bytes: u64,
    pub extents: Vec<Extent>,
    /// Content stored inside the metadata record itself
    pub resident: Option<Bytes>,
    pub confidence: f32,
    pub diagnostics: Vec<Diagnostic>,
    /// Directory entry byte offset (FAT) or MFT record number (NTFS)
    pub record_ref: u64,
}

impl DirectoryNode {
    pub fn new(id: NodeId, name: impl Into<String>, allocation: AllocationStatus) -> Self {
        Self {
            id,
            parent: None,
            name: name.into(),
            attributes: NodeAttributes::default(),
            allocation,
            size_bytes: 0,
            extents: Vec::new(),
            resident: None,
            confidence: 1.0,
            diagnostics: Vec::new(),
            record_ref: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.directory
    }

    pub fn allocated_units(&self) -> u64 {
        self.extents
            .iter()
            .fold(0u64, |total, e| total.saturating_add(e.unit_count))
    }

    /// Lowers confidence and records why
    pub fn degrade(&mut self, penalty: f32, diagnostic: Diagnostic) {
        self.confidence = (self.confidence - penalty).clamp(0.0, 1.0);
        self.diagnostics.push(diagnostic);
    }
}

/// Maps allocation units to absolute medium offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    /// Byte offset of the volume on the medium
    pub volume_offset: u64,
    /// Bytes per allocation unit
    pub unit_size: u64,
    /// Absolute byte offset of `first_unit`
    pub units_origin: u64,
    /// Number of the first addressable unit (2 on FAT, 0 on NTFS)
    pub first_unit: u64,
    /// Count of addressable units
    pub total_units: u64,
}

impl VolumeGeometry {
    pub fn contains_unit(&self, unit: u64) -> bool {
        unit >= self.first_unit && unit - self.first_unit < self.total_units
    }

    pub fn unit_offset(&self, unit: u64) -> u64 {
        unit.saturating_sub(self.first_unit)
            .saturating_mul(self.unit_size)
            .saturating_add(self.units_origin)
    }

    /// Absolute byte range of a non-sparse extent
    pub fn extent_bytes(&self, extent: &Extent) -> Range<u64> {
        let start = self.unit_offset(extent.start_unit);
        start..start.saturating_add(extent.unit_count.saturating_mul(self.unit_size))
    }
}

/// All nodes recovered from one volume
#[derive(Debug, Clone)]
pub struct FileSystemForest {
    pub kind: FileSystemKind,
    pub geometry: VolumeGeometry,
    pub nodes: Vec<DirectoryNode>,
    pub roots: Vec<NodeId>,
    pub diagnostics: Vec<Diagnostic>,
}

impl FileSystemForest {
    pub fn new(kind: FileSystemKind, geometry: VolumeGeometry) -> Self {
        Self {
            kind,
            geometry,
            nodes: Vec::new(),
            roots: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Appends a node, assigning its id
    pub fn push(&mut self, mut node: DirectoryNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        if node.parent.is_none() {
            self.roots.push(id);
        }
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&DirectoryNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut DirectoryNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &DirectoryNode> {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }

    /// Non-directory nodes
    pub fn files(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.nodes.iter().filter(|n| !n.is_directory())
    }

    pub fn count_by_status(&self, status: AllocationStatus) -> usize {
        self.files().filter(|n| n.allocation == status).count()
    }

    /// Slash-separated path from the root, bounded against parent cycles
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id);

        while let Some(cursor) = current {
            if !seen.insert(cursor) {
                break;
            }
            let Some(node) = self.node(cursor) else { break };
            parts.push(node.name.as_str());
            current = node.parent;
        }

        parts.reverse();
        parts.join("/")
    }

    /// Absolute byte ranges backing a node, tagged with their logical offset.
    ///
    /// Sparse runs advance the logical offset without contributing a range.
    /// The last range is clipped to the node size.
    pub fn byte_ranges(&self, node: &DirectoryNode) -> Vec<(u64, Range<u64>)> {
        let mut ranges = Vec::new();
        let mut logical = 0u64;
        let limit = node.size_bytes;

        for extent in &node.extents {
            if logical >= limit {
                break;
            }
            let span = extent.unit_count.saturating_mul(self.geometry.unit_size);
            let usable = span.min(limit - logical);
            if !extent.sparse {
                let start = self.geometry.unit_offset(extent.start_unit);
                ranges.push((logical, start..start.saturating_add(usable)));
            }
            logical += usable;
        }
        ranges
    }

    /// Bytes of a node that no extent can supply: lost holes plus any
    /// shortfall between the extents and the node size
    pub fn lost_bytes(&self, node: &DirectoryNode) -> u64 {
        if let Some(resident) = &node.resident {
            return node.size_bytes.saturating_sub(resident.len() as u64);
        }
        let mut lost = 0u64;
        let mut logical = 0u64;
        let limit = node.size_bytes;

        for extent in &node.extents {
            if logical >= limit {
                break;
            }
            let span = extent.unit_count.saturating_mul(self.geometry.unit_size);
            let usable = span.min(limit - logical);
            if extent.lost {
                lost += usable;
            }
            logical += usable;
        }
        lost + (limit - logical.min(limit))
    }
}
