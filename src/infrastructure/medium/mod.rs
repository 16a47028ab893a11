//! Medium implementations and the retrying reader

mod file_medium;
mod memory_medium;
mod mmap_medium;
pub(crate) mod positioned;
mod reader;

pub use file_medium::FileMedium;
pub use memory_medium::MemoryMedium;
pub use mmap_medium::MmapMedium;
pub use reader::{MediumReader, ReadStats, RetryPolicy};
