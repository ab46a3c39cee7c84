//! Remote node types

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Opaque remote node identifier
///
/// Handles are not stable across content replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// How much the account may do with a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum AccessLevel {
    ReadOnly,
    ReadWrite,
    #[default]
    Full,
}

impl AccessLevel {
    pub fn writable(self) -> bool {
        self >= AccessLevel::ReadWrite
    }
}

/// Remote description of a file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: SystemTime,
    pub permissions: AccessLevel,
}

/// Content to store under `parent`
#[derive(Debug, Clone)]
pub struct Upload {
    pub parent: NodeHandle,
    pub name: String,
    pub content: Bytes,
    pub modified: SystemTime,
    /// Existing node the upload supersedes
    pub replace: Option<NodeHandle>,
}
