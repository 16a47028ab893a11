//! Application layer
//!
//! The recovery session and the pieces it orchestrates: reconciliation of
//! filesystem and carved results, export, events and the DTOs.

pub mod dto;
mod events;
mod export;
mod reconcile;
mod recovery_session;

pub use events::{EventBus, SessionEvent};
pub use export::{export_file, plan_paths, ExportFailure};
pub use reconcile::reconcile;
pub use recovery_session::{RecoverySession, SessionError};

use crate::domain::services::SignatureCatalog;
use anyhow::Context;
use std::path::Path;

/// Loads a JSON signature catalog to pass to [`RecoverySession::with_catalog`]
pub fn load_signature_catalog(path: impl AsRef<Path>) -> anyhow::Result<SignatureCatalog> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading signature catalog {}", path.display()))?;
    SignatureCatalog::from_json(&text)
        .with_context(|| format!("parsing signature catalog {}", path.display()))
}
