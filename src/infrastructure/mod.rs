//! Infrastructure layer
//!
//! Concrete implementations of the domain repositories: medium backends,
//! the snapshot cache, filesystem parsers, the carver and the export sink.

pub mod carvers;
pub mod file_systems;
pub mod medium;
pub mod persistence;
pub mod snapshot;
