//! FAT32 filesystem parser
//!
//! Decodes the BPB, the allocation table and the directory tree, deleted
//! entries included.

mod boot_sector;
mod dir_entry;
mod parser;
mod table;

pub use boot_sector::Fat32BootSector;
pub use parser::Fat32Parser;
pub use table::{ChainStop, ChainWalk, FatTable};
