//! Domain services
//!
//! Pure logic shared by parsers, the carver and the session.

mod byte_range_set;
mod cancellation;
mod ownership;
mod scoring;
mod signature_catalog;

pub use byte_range_set::ByteRangeSet;
pub use cancellation::CancellationToken;
pub use ownership::OwnershipMap;
pub use scoring::carve_confidence;
pub use signature_catalog::{CatalogError, SignatureCatalog};
