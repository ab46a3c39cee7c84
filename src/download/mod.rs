//! Partial Downloads
//!
//! Fetches remote file content on demand, range by range, writing it
//! through to local storage as it arrives. Readers are answered as soon as
//! enough of their range is resident instead of waiting for whole files.

mod partial;

use std::io;

use bytes::Bytes;

pub use partial::{PartialDownloadContext, PartialDownloadManager};

/// Local storage that downloaded ranges are written into
pub trait RangeSink: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn read_at(&self, offset: u64, length: u64) -> io::Result<Bytes>;
}
