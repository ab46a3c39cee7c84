//! Kernel inode numbers
//!
//! FUSE requires the root to be inode 1. Every other engine inode id is
//! used unchanged, so the mapping is stable for the lifetime of a mount.

use crate::inode::InodeID;

/// Root inode number (always 1 per FUSE convention)
pub const ROOT_INO: u64 = 1;

/// Translation between kernel inode numbers and engine ids for one mount
#[derive(Debug, Clone, Copy)]
pub struct InoMap {
    root: InodeID,
}

impl InoMap {
    pub fn new(root: InodeID) -> Self {
        Self { root }
    }

    pub fn to_ino(&self, id: InodeID) -> u64 {
        if id == self.root {
            ROOT_INO
        } else {
            id.get()
        }
    }

    pub fn to_id(&self, ino: u64) -> InodeID {
        if ino == ROOT_INO {
            self.root
        } else {
            InodeID::new(ino)
        }
    }
}
