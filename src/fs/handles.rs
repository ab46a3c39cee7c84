//! File Handle Tracking
//!
//! Each open() call creates a handle, read()/write() use it, release() removes it.
//! A handle keeps its file's I/O context alive, so cached content stays
//! resident until the last handle is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::mount::OpenFile;

/// Manages all open file handles of one mount
pub struct HandleTable {
    handles: HashMap<u64, OpenFile>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            // Start at 1 (0 is sometimes special in FUSE)
            next_fh: AtomicU64::new(1),
        }
    }

    /// Register an open file
    ///
    /// # Returns
    /// File handle ID
    pub fn open(&mut self, file: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        debug!(fh = fh, id = %file.id(), writable = file.writable(), "Opened file handle");
        self.handles.insert(fh, file);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<&OpenFile> {
        self.handles.get(&fh)
    }

    /// Close a file handle and return it
    ///
    /// The caller is responsible for flushing before dropping it.
    pub fn close(&mut self, fh: u64) -> Option<OpenFile> {
        let handle = self.handles.remove(&fh);
        if let Some(ref h) = handle {
            debug!(fh = fh, id = %h.id(), "Closed file handle");
        }
        handle
    }

    /// Drop every handle
    pub fn clear(&mut self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
