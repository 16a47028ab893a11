//! NTFS filesystem parser implementation
//!
//! Parses the NTFS boot sector and the MFT (Master File Table). Every FILE
//! record becomes a node, deleted records included; the parent references
//! in `$FILE_NAME` link them into a tree rooted at record 5.

use super::boot_sector::{NtfsBootSector, BOOT_SECTOR_SIZE};
use super::data_runs::DataRun;
use super::mft_record::{DataStream, MftRecord, RecordFault};
use crate::domain::entities::{
    AllocationStatus, Diagnostic, DirectoryNode, Extent, FileSystemForest, NodeAttributes, NodeId,
    VolumeGeometry,
};
use crate::domain::repositories::{ByteSource, FileSystemError, FileSystemKind, FileSystemParser};
use crate::domain::services::{CancellationToken, OwnershipMap};
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, info, instrument, warn};

/// Root directory record
const ROOT_RECORD: u64 = 5;
/// Records below this number are filesystem metadata
const FIRST_USER_RECORD: u64 = 16;
/// Records read per medium request
const RECORD_BATCH: u64 = 64;

const DELETED_CONFIDENCE: f32 = 0.8;
const REUSED_PENALTY: f32 = 0.4;
const UNSUPPORTED_STREAM_PENALTY: f32 = 0.3;

/// Part of the MFT; `range` is `None` when its run points nowhere usable
struct MftSpan {
    range: Option<Range<u64>>,
    records: u64,
}

/// Where the MFT lives, in record order
struct MftLayout {
    spans: Vec<MftSpan>,
    records: u64,
}

/// NTFS parser bound to one volume
pub struct NtfsParser {
    boot: NtfsBootSector,
    volume_offset: u64,
    max_records: u64,
}

impl NtfsParser {
    /// Reads and validates the boot sector at `volume_offset`
    pub fn open(
        source: &dyn ByteSource,
        volume_offset: u64,
        max_records: u64,
    ) -> Result<Self, FileSystemError> {
        let outcome = source.read(volume_offset, BOOT_SECTOR_SIZE)?;
        if outcome.is_degraded() {
            return Err(FileSystemError::InvalidBootSector(
                "NTFS boot sector unreadable".to_string(),
            ));
        }
        let boot = NtfsBootSector::parse(&outcome.data)?;
        Ok(Self {
            boot,
            volume_offset,
            max_records: max_records.max(1),
        })
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    fn geometry(&self, source: &dyn ByteSource) -> VolumeGeometry {
        let cluster_size = self.boot.cluster_size();
        let addressable = source.size().saturating_sub(self.volume_offset) / cluster_size;
        VolumeGeometry {
            volume_offset: self.volume_offset,
            unit_size: cluster_size,
            units_origin: self.volume_offset,
            first_unit: 0,
            total_units: self.boot.total_clusters().min(addressable),
        }
    }

    fn record_size(&self) -> u64 {
        self.boot.mft_record_size()
    }

    /// Locates the MFT through record 0's own data runs, falling back to a
    /// contiguous MFT when record 0 cannot be used
    fn mft_layout(
        &self,
        source: &dyn ByteSource,
        geometry: &VolumeGeometry,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<MftLayout, FileSystemError> {
        let start = self.volume_offset + self.boot.mft_offset();
        let record_size = self.record_size();
        let volume_end = (self.volume_offset + self.boot.volume_size()).min(source.size());

        let outcome = source.read(start, record_size as usize)?;
        let mut buf = outcome.data;
        let record0 = if outcome.degraded.is_empty() {
            MftRecord::parse(0, &mut buf)
        } else {
            Err(RecordFault::Malformed("record 0 unreadable".into()))
        };

        match record0 {
            Ok(Some(MftRecord {
                data: Some(DataStream::NonResident { runs, real_size, .. }),
                ..
            })) if !runs.is_empty() => {
                let mut spans = Vec::new();
                let mut remaining = real_size;
                for run in runs {
                    if remaining == 0 {
                        break;
                    }
                    let bytes = run.length.saturating_mul(geometry.unit_size).min(remaining);
                    remaining -= bytes;
                    let records = bytes / record_size;
                    match run.lcn {
                        Some(lcn) if geometry.contains_unit(lcn) => {
                            let offset = geometry.unit_offset(lcn);
                            let end = offset.saturating_add(bytes).min(volume_end);
                            spans.push(MftSpan {
                                range: Some(offset..end),
                                records: end.saturating_sub(offset) / record_size,
                            });
                        }
                        _ => {
                            diagnostics.push(Diagnostic::structural(
                                "$MFT",
                                format!("MFT run {run:?} unusable, records there are lost"),
                            ));
                            spans.push(MftSpan {
                                range: None,
                                records,
                            });
                        }
                    }
                }
                let records = (real_size / record_size).min(self.max_records);
                debug!(runs = spans.len(), records, "MFT located through its own run-list");
                Ok(MftLayout { spans, records })
            }
            other => {
                let reason = match other {
                    Err(fault) => fault.to_string(),
                    _ => "no usable $DATA run-list".to_string(),
                };
                warn!(%reason, "MFT record 0 unusable, assuming a contiguous MFT");
                diagnostics.push(Diagnostic::structural(
                    "$MFT",
                    format!("record 0 unusable ({reason}), MFT assumed contiguous"),
                ));
                let records = (volume_end.saturating_sub(start) / record_size).min(self.max_records);
                Ok(MftLayout {
                    spans: vec![MftSpan {
                        range: Some(start..start + records * record_size),
                        records,
                    }],
                    records,
                })
            }
        }
    }

    /// Reads every record slot, keeping the ones that decode
    fn read_records(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
        layout: &MftLayout,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<MftRecord>, FileSystemError> {
        let record_size = self.record_size();
        let mut records = Vec::new();
        let mut number = 0u64;

        for span in &layout.spans {
            let Some(range) = &span.range else {
                // unusable runs still advance the numbering
                number += span.records;
                continue;
            };
            let mut done = 0;
            while done < span.records && number < layout.records {
                if cancel.is_cancelled() {
                    return Err(FileSystemError::Cancelled);
                }
                let batch = RECORD_BATCH
                    .min(span.records - done)
                    .min(layout.records - number);
                let offset = range.start + done * record_size;
                let outcome = source.read(offset, (batch * record_size) as usize)?;

                for (i, chunk) in outcome.data.chunks_exact(record_size as usize).enumerate() {
                    let at = offset + i as u64 * record_size;
                    let current = number + i as u64;
                    if outcome.overlaps_degraded(&(at..at + record_size)) {
                        diagnostics.push(Diagnostic::unreadable(
                            format!("MFT record {current}"),
                            "record unreadable, skipped",
                        ));
                        continue;
                    }
                    let mut buf = chunk.to_vec();
                    match MftRecord::parse(current, &mut buf) {
                        Ok(Some(record)) => records.push(record),
                        Ok(None) => {}
                        Err(fault) => diagnostics.push(Diagnostic::structural(
                            format!("MFT record {current}"),
                            fault.to_string(),
                        )),
                    }
                }
                done += batch;
                number += batch;
            }
        }
        Ok(records)
    }

    /// Whether a record describes a user-visible file or directory
    fn is_user_record(record: &MftRecord, diagnostics: &mut Vec<Diagnostic>) -> bool {
        if record.base_record != 0 || record.number < FIRST_USER_RECORD {
            return false;
        }
        let Some(name) = &record.file_name else {
            return false;
        };
        if name.name.starts_with('$') && name.parent_record < FIRST_USER_RECORD && name.parent_record != ROOT_RECORD {
            return false;
        }
        if !record.in_use && record.sequence == 0 {
            diagnostics.push(Diagnostic::structural(
                format!("MFT record {}", record.number),
                "deleted record with sequence 0 looks overwritten, skipped",
            ));
            return false;
        }
        true
    }

    fn build_node(&self, record: &MftRecord, geometry: &VolumeGeometry) -> DirectoryNode {
        let name = record
            .file_name
            .as_ref()
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let allocation = if record.in_use {
            AllocationStatus::Active
        } else {
            AllocationStatus::Deleted
        };

        let mut node = DirectoryNode::new(NodeId(0), name, allocation);
        node.record_ref = record.number;
        node.attributes = NodeAttributes::from_dos(record.dos_attributes.unwrap_or(0));
        node.attributes.directory = record.directory;
        node.confidence = if record.in_use { 1.0 } else { DELETED_CONFIDENCE };

        if record.directory {
            return node;
        }

        match &record.data {
            Some(DataStream::Resident(bytes)) => {
                node.size_bytes = bytes.len() as u64;
                node.resident = Some(bytes.clone());
            }
            Some(DataStream::NonResident {
                runs,
                real_size,
                compressed,
                encrypted,
                ..
            }) => {
                node.size_bytes = *real_size;
                node.extents = runs.iter().map(|run| extent_of(run, geometry)).collect();
                let subject = format!("MFT record {}", record.number);
                if *compressed || *encrypted {
                    let what = if *compressed { "compressed" } else { "encrypted" };
                    node.degrade(
                        UNSUPPORTED_STREAM_PENALTY,
                        Diagnostic::structural(
                            subject.clone(),
                            format!("{what} stream, raw clusters mapped without decoding"),
                        ),
                    );
                }
                let outside = node
                    .extents
                    .iter()
                    .any(|e| !e.sparse && e.unit_count > 0 && !geometry.contains_unit(e.end_unit() - 1));
                if outside {
                    node.extents = node
                        .extents
                        .iter()
                        .map(|e| clip_to_volume(e, geometry))
                        .collect();
                    node.degrade(
                        REUSED_PENALTY,
                        Diagnostic::structural(subject, "runs extend beyond the volume"),
                    );
                }
            }
            None => {}
        }
        node
    }

    /// Active records claim clusters first; a deleted record whose runs are
    /// all in range and unclaimed is orphaned content, otherwise it keeps
    /// what is free and loses the rest
    fn assign_ownership(forest: &mut FileSystemForest) -> OwnershipMap {
        let mut owners = OwnershipMap::new();
        let order: Vec<NodeId> = {
            let (active, deleted): (Vec<&DirectoryNode>, Vec<&DirectoryNode>) = forest
                .nodes
                .iter()
                .partition(|n| n.allocation == AllocationStatus::Active);
            active.iter().chain(deleted.iter()).map(|n| n.id).collect()
        };

        for id in order {
            let node = &forest.nodes[id.0];
            let active = node.allocation == AllocationStatus::Active;

            if !active && node.resident.is_some() {
                forest.nodes[id.0].allocation = AllocationStatus::Orphaned;
                continue;
            }
            if node.extents.is_empty() {
                continue;
            }

            let conflicts: Vec<NodeId> = node
                .extents
                .iter()
                .filter(|e| !e.sparse)
                .filter_map(|e| owners.first_conflict(e.units()).map(|(_, owner)| owner))
                .collect();

            let mut extents = Vec::with_capacity(node.extents.len());
            for extent in node.extents.clone() {
                if extent.sparse {
                    extents.push(extent);
                    continue;
                }
                let granted = owners.claim(extent.units(), id);
                extents.extend(fill_holes(&extent, &granted));
            }

            let subject = format!("MFT record {}", node.record_ref);
            let holder = conflicts.first().map(|&owner| forest.path_of(owner));
            let node = &mut forest.nodes[id.0];
            node.extents = extents;

            match holder {
                Some(holder) => node.degrade(
                    REUSED_PENALTY,
                    Diagnostic::structural(subject, format!("clusters reused by {holder}")),
                ),
                None if !active && node.diagnostics.is_empty() => {
                    node.allocation = AllocationStatus::Orphaned;
                }
                None => {}
            }
        }
        owners
    }
}

/// Allocated runs never span more clusters than the volume holds
fn extent_of(run: &DataRun, geometry: &VolumeGeometry) -> Extent {
    match run.lcn {
        Some(lcn) => Extent::new(lcn, run.length.min(geometry.total_units)),
        None => Extent::sparse(run.length),
    }
}

/// Replaces the part of an extent outside the volume with a hole
fn clip_to_volume(extent: &Extent, geometry: &VolumeGeometry) -> Extent {
    if extent.sparse || geometry.contains_unit(extent.end_unit().saturating_sub(1)) {
        *extent
    } else {
        Extent::lost(extent.unit_count)
    }
}

/// Rebuilds an extent from its granted pieces, turning the rest into holes
/// so later runs keep their logical position
fn fill_holes(extent: &Extent, granted: &[Range<u64>]) -> Vec<Extent> {
    let mut pieces = Vec::new();
    let mut cursor = extent.start_unit;
    for run in granted {
        if run.start > cursor {
            pieces.push(Extent::lost(run.start - cursor));
        }
        pieces.push(Extent::new(run.start, run.end - run.start));
        cursor = run.end;
    }
    if cursor < extent.end_unit() {
        pieces.push(Extent::lost(extent.end_unit() - cursor));
    }
    pieces
}

impl FileSystemParser for NtfsParser {
    fn kind(&self) -> FileSystemKind {
        FileSystemKind::Ntfs
    }

    #[instrument(skip_all, fields(volume_offset = self.volume_offset))]
    fn parse(
        &self,
        source: &dyn ByteSource,
        cancel: &CancellationToken,
    ) -> Result<FileSystemForest, FileSystemError> {
        let geometry = self.geometry(source);
        let mut forest = FileSystemForest::new(FileSystemKind::Ntfs, geometry);

        let layout = self.mft_layout(source, &geometry, &mut forest.diagnostics)?;
        let records = self.read_records(source, cancel, &layout, &mut forest.diagnostics)?;
        let scanned = records.len();

        let kept: Vec<MftRecord> = records
            .into_iter()
            .filter(|r| Self::is_user_record(r, &mut forest.diagnostics))
            .collect();
        let index: HashMap<u64, usize> = kept
            .iter()
            .enumerate()
            .map(|(i, r)| (r.number, i))
            .collect();

        for record in &kept {
            let mut node = self.build_node(record, &geometry);
            node.parent = record.file_name.as_ref().and_then(|name| {
                if name.parent_record == ROOT_RECORD || name.parent_record == record.number {
                    return None;
                }
                let &slot = index.get(&name.parent_record)?;
                let parent = &kept[slot];
                // a live parent with another sequence number is a reused slot
                if parent.in_use && parent.sequence != name.parent_sequence {
                    return None;
                }
                Some(NodeId(slot))
            });
            forest.push(node);
        }

        if cancel.is_cancelled() {
            return Err(FileSystemError::Cancelled);
        }
        let owners = Self::assign_ownership(&mut forest);

        info!(
            serial = format!("{:016X}", self.boot.volume_serial),
            records = scanned,
            nodes = forest.nodes.len(),
            active = forest.count_by_status(AllocationStatus::Active),
            deleted = forest.count_by_status(AllocationStatus::Deleted),
            orphaned = forest.count_by_status(AllocationStatus::Orphaned),
            claimed_clusters = owners.claimed_units(),
            "NTFS volume parsed"
        );
        Ok(forest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_keep_logical_positions() {
        let extent = Extent::new(10, 10);
        let pieces = fill_holes(&extent, &[12..14, 16..20]);
        assert_eq!(
            pieces,
            vec![
                Extent::lost(2),
                Extent::new(12, 2),
                Extent::lost(2),
                Extent::new(16, 4),
            ]
        );
        let units: u64 = pieces.iter().map(|p| p.unit_count).sum();
        assert_eq!(units, 10);
    }

    fn geometry() -> VolumeGeometry {
        VolumeGeometry {
            volume_offset: 0,
            unit_size: 4096,
            units_origin: 0,
            first_unit: 0,
            total_units: 256,
        }
    }

    #[test]
    fn corrupt_run_lengths_are_capped_to_the_volume() {
        let g = geometry();
        let huge = DataRun {
            lcn: Some(1),
            length: 1 << 56,
        };
        let extent = extent_of(&huge, &g);
        assert_eq!(extent, Extent::new(1, 256));
        assert_eq!(clip_to_volume(&extent, &g), Extent::lost(256));

        let hole = DataRun {
            lcn: None,
            length: 1 << 56,
        };
        assert_eq!(extent_of(&hole, &g), Extent::sparse(1 << 56));
    }

    #[test]
    fn recorded_holes_are_not_lost() {
        let g = geometry();
        assert_eq!(clip_to_volume(&Extent::sparse(4), &g), Extent::sparse(4));
        assert_eq!(clip_to_volume(&Extent::new(10, 4), &g), Extent::new(10, 4));
    }
}
