//! Observable session events
//!
//! Presentation code subscribes to a broadcast channel; sending never
//! blocks and works with or without an async runtime. A slow subscriber
//! loses the oldest events rather than stalling the session.

use crate::domain::entities::{Diagnostic, ExportStatus, ScanProgress, SessionState};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Progress(ScanProgress),
    FileStatus {
        id: u64,
        status: ExportStatus,
    },
    Diagnostic(Diagnostic),
}

/// Sending half shared by the session and its workers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publishes to current subscribers; no subscribers is fine
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
