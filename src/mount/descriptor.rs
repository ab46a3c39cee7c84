//! Mount descriptors

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::remote::NodeHandle;

/// Behavior switches of a mount
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountFlags {
    /// Refuse every change through this mount
    pub read_only: bool,
    /// Keep the descriptor across restarts
    pub persistent: bool,
    /// Enable the mount when the service starts
    pub enable_at_startup: bool,
}

/// Where a remote directory is mounted, and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Unique, user-chosen name
    pub name: String,
    /// Local mount point
    pub path: PathBuf,
    /// Remote directory exposed as the mount's root
    pub handle: NodeHandle,
    #[serde(flatten)]
    pub flags: MountFlags,
}

impl MountDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, handle: NodeHandle) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            handle,
            flags: MountFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_flattened() {
        let descriptor = MountDescriptor::new("docs", "/mnt/docs", NodeHandle(7)).with_flags(MountFlags {
            read_only: true,
            ..MountFlags::default()
        });

        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["read_only"], true);
        assert_eq!(value["persistent"], false);
        assert_eq!(value["handle"], 7);

        let parsed: MountDescriptor = serde_json::from_value(serde_json::json!({
            "name": "docs",
            "path": "/mnt/docs",
            "handle": 7
        }))
        .unwrap();
        assert_eq!(parsed.flags, MountFlags::default());
    }
}
