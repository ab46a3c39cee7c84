//! Persisted document layout (current version)

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::inode::InodeID;
use crate::mount::MountDescriptor;
use crate::remote::NodeHandle;

/// Version written by this build
pub const SCHEMA_VERSION: u32 = 3;

/// Inode id allocator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeIdState {
    pub next: u64,
}

/// Local state of an inode that must survive a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub id: InodeID,
    /// Remote node, absent until the first upload
    pub handle: Option<NodeHandle>,
    /// Modification time in seconds since the epoch
    pub modified: i64,
    pub name: String,
    pub parent_handle: Option<NodeHandle>,
    /// Set while local content is waiting to be uploaded
    pub bind_handle: Option<String>,
    /// Backing file extension, including the dot
    pub extension: String,
}

impl InodeRecord {
    /// Whether content was left unflushed
    pub fn pending(&self) -> bool {
        self.bind_handle.is_some() || self.handle.is_none()
    }
}

/// The whole persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub version: u32,
    pub inode_id: InodeIdState,
    pub inodes: Vec<InodeRecord>,
    pub mounts: Vec<MountDescriptor>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            inode_id: InodeIdState {
                next: InodeID::FIRST.get(),
            },
            inodes: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

/// Seconds since the epoch, negative for times before it
pub fn to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

pub fn from_unix(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}
