//! File system parsers

pub mod dispatcher;
pub mod fat32;
mod mbr;
pub mod ntfs;

pub use dispatcher::{detect, Detection, VolumeParser};
pub use fat32::Fat32Parser;
pub use ntfs::NtfsParser;
