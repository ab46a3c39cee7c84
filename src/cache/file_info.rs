//! Local content records

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::inode::InodeID;
use crate::remote::NodeHandle;

/// Backing file extension for `name`, including the dot
///
/// Keeping the extension lets platform tooling recognise cached files.
pub fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(dot) if dot + 1 == name.len() => String::new(),
        Some(dot) => name[dot..].to_string(),
    }
}

struct FileInfoState {
    size: u64,
    modified: SystemTime,
    /// Remote node the local content was taken from
    source: Option<NodeHandle>,
    /// Every byte of `source` is resident
    complete: bool,
}

/// What is known about the local copy of one file
pub struct FileInfo {
    id: InodeID,
    extension: String,
    path: PathBuf,
    state: Mutex<FileInfoState>,
}

impl FileInfo {
    pub fn new(id: InodeID, extension: String, path: PathBuf, size: u64, modified: SystemTime) -> Self {
        Self {
            id,
            extension,
            path,
            state: Mutex::new(FileInfoState {
                size,
                modified,
                source: None,
                complete: false,
            }),
        }
    }

    pub fn id(&self) -> InodeID {
        self.id
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Backing file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn modified(&self) -> SystemTime {
        self.state.lock().modified
    }

    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    pub fn set_modified(&self, modified: SystemTime) {
        self.state.lock().modified = modified;
    }

    /// Record a local change of content
    pub fn update(&self, size: u64, modified: SystemTime) {
        let mut state = self.state.lock();
        state.size = size;
        state.modified = modified;
    }

    pub fn source(&self) -> Option<NodeHandle> {
        self.state.lock().source
    }

    /// Whether the local copy holds all of `handle`'s content
    pub fn complete_for(&self, handle: Option<NodeHandle>) -> bool {
        let state = self.state.lock();
        state.complete && handle.is_some() && state.source == handle
    }

    /// Point the record at a remote node
    ///
    /// # Arguments
    /// * `complete` - All of the node's content is already resident
    pub fn set_source(&self, handle: Option<NodeHandle>, complete: bool) {
        let mut state = self.state.lock();
        state.source = handle;
        state.complete = complete;
    }

    pub fn set_complete(&self, complete: bool) {
        self.state.lock().complete = complete;
    }
}

impl std::fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FileInfo")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &state.size)
            .field("source", &state.source)
            .field("complete", &state.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        assert_eq!(extension("report.pdf"), ".pdf");
        assert_eq!(extension("archive.tar.gz"), ".gz");
        assert_eq!(extension("Makefile"), "");
        assert_eq!(extension(".bashrc"), "");
        assert_eq!(extension("trailing."), "");
    }

    #[test]
    fn test_complete_for_tracks_source() {
        let info = FileInfo::new(
            InodeID::new(3),
            ".txt".into(),
            PathBuf::from("/tmp/x.txt"),
            0,
            SystemTime::UNIX_EPOCH,
        );
        assert!(!info.complete_for(Some(NodeHandle(5))));

        info.set_source(Some(NodeHandle(5)), true);
        assert!(info.complete_for(Some(NodeHandle(5))));
        assert!(!info.complete_for(Some(NodeHandle(6))));
        assert!(!info.complete_for(None));
    }
}
