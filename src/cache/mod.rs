//! Content caching layer
//!
//! Keeps file content on local disk and writes changes back to the remote
//! after a short delay, so bursts of writes become a single upload.

mod backing;
mod file_cache;
mod file_info;
mod io_context;

pub use backing::BackingFile;
pub use file_cache::FileCache;
pub use file_info::{extension, FileInfo};
pub use io_context::FileIOContext;
