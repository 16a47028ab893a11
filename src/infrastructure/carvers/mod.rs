//! Signature carving
//!
//! Recovers files from raw bytes when filesystem metadata is missing or
//! does not cover them.

mod signature_carver;
pub(crate) mod structure;

pub use signature_carver::{suppress_overlaps, CarveScan, SignatureCarver};
pub use structure::verify as verify_structure;
