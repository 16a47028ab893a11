//! reclaim
//!
//! Read-only recovery of deleted and lost files from FAT32 and NTFS media
//! and raw disk images.
//!
//! Every byte is read through a copy-on-read [`Snapshot`] over a retrying
//! [`MediumReader`]; the medium is never opened for writing. A
//! [`RecoverySession`] parses the filesystem it finds, carves the
//! remaining bytes by signature, reconciles both result sets and exports
//! the files through an [`ExportSink`].
//!
//! [`Snapshot`]: infrastructure::snapshot::Snapshot
//! [`MediumReader`]: infrastructure::medium::MediumReader
//! [`RecoverySession`]: application::RecoverySession
//! [`ExportSink`]: domain::repositories::ExportSink

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod telemetry;
pub mod utils;

pub use application::dto::{RecoveryConfig, RecoveryReport};
pub use application::{RecoverySession, SessionError, SessionEvent};
pub use domain::entities::{ExportStatus, Provenance, RecoveredFile, SessionState};
pub use domain::services::CancellationToken;
