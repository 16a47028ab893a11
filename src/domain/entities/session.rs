//! Session state machine and progress

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a recovery session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ScanningFilesystem,
    ScanningSignatures,
    Reconciling,
    Exporting,
    Done,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Cancelled | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, ScanningFilesystem)
                | (Idle, ScanningSignatures)
                | (ScanningFilesystem, ScanningSignatures)
                | (ScanningFilesystem, Reconciling)
                | (ScanningSignatures, Reconciling)
                | (Reconciling, Exporting)
                | (Exporting, Done)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ScanningFilesystem => "scanning-filesystem",
            Self::ScanningSignatures => "scanning-signatures",
            Self::Reconciling => "reconciling",
            Self::Exporting => "exporting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Phase a progress report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Filesystem,
    Signatures,
    Export,
}

/// Progress information during a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    /// Bytes processed so far
    pub bytes_done: u64,
    /// Bytes this phase will process
    pub bytes_total: u64,
}

impl ScanProgress {
    pub fn new(phase: ScanPhase, bytes_total: u64) -> Self {
        Self {
            phase,
            bytes_done: 0,
            bytes_total,
        }
    }

    /// Returns the progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_done.min(self.bytes_total) as f64 / self.bytes_total as f64) * 100.0
    }
}
