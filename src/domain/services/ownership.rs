//! Allocation-unit ownership map
//!
//! Resolves cross-links: whoever claims a unit first owns it, and callers
//! control priority by the order in which they claim.

use crate::domain::entities::NodeId;
use std::collections::BTreeMap;
use std::ops::Range;

/// Claimed unit runs keyed by start unit
#[derive(Debug, Clone, Default)]
pub struct OwnershipMap {
    runs: BTreeMap<u64, (u64, NodeId)>,
}

impl OwnershipMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of `unit`, if claimed
    pub fn owner_of(&self, unit: u64) -> Option<NodeId> {
        self.runs
            .range(..=unit)
            .next_back()
            .filter(|(_, (end, _))| unit < *end)
            .map(|(_, (_, owner))| *owner)
    }

    /// First claimed unit inside `units` together with its owner
    pub fn first_conflict(&self, units: Range<u64>) -> Option<(u64, NodeId)> {
        if let Some(owner) = self.owner_of(units.start) {
            return Some((units.start, owner));
        }
        self.runs
            .range(units.start..units.end)
            .next()
            .map(|(start, (_, owner))| (*start, *owner))
    }

    pub fn is_free(&self, units: Range<u64>) -> bool {
        units.is_empty() || self.first_conflict(units).is_none()
    }

    /// Claims every free unit in `units` for `owner`.
    ///
    /// Returns the granted sub-runs in ascending order; units that were
    /// already owned are left untouched.
    pub fn claim(&mut self, units: Range<u64>, owner: NodeId) -> Vec<Range<u64>> {
        let mut granted = Vec::new();
        let mut cursor = units.start;

        while cursor < units.end {
            match self.first_conflict(cursor..units.end) {
                Some((conflict, _)) if conflict == cursor => {
                    // skip the owned run
                    let end = self
                        .runs
                        .range(..=cursor)
                        .next_back()
                        .map(|(_, (end, _))| *end)
                        .unwrap_or(cursor + 1);
                    cursor = end.min(units.end);
                }
                Some((conflict, _)) => {
                    granted.push(cursor..conflict);
                    cursor = conflict;
                }
                None => {
                    granted.push(cursor..units.end);
                    cursor = units.end;
                }
            }
        }

        for run in &granted {
            self.runs.insert(run.start, (run.end, owner));
        }
        granted
    }

    /// Total claimed units
    pub fn claimed_units(&self) -> u64 {
        self.runs.iter().map(|(start, (end, _))| end - start).sum()
    }
}
