//! NTFS filesystem parser
//!
//! Parses NTFS filesystem metadata, deleted records included.
//! NTFS uses a Master File Table (MFT) for file metadata.

mod boot_sector;
mod data_runs;
mod mft_record;
mod parser;

pub use boot_sector::NtfsBootSector;
pub use data_runs::{decode_data_runs, DataRun, RunListError};
pub use mft_record::{apply_fixups, DataStream, FileName, MftRecord, RecordFault};
pub use parser::NtfsParser;
