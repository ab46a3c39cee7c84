//! Mount layer
//!
//! Descriptors and the persisted [`MountTable`], the [`Mount`] facade that
//! platform shims drive, and the seams ([`Platform`], [`Invalidator`])
//! through which the engine reaches the operating system.

mod descriptor;
mod invalidate;
mod platform;
mod table;
mod volume;

use std::path::PathBuf;

pub use descriptor::{MountDescriptor, MountFlags};
pub use invalidate::{HubToken, Invalidation, InvalidationHub, Invalidator, RecordingInvalidator};
pub use platform::{NullPlatform, Platform, Session};
pub use table::MountTable;
pub use volume::{Mount, OpenFile};

use crate::db::DbError;
use crate::error::FsError;
use crate::remote::NodeHandle;

/// Mount table errors
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Mount name must not be empty")]
    NoName,

    #[error("Mount name already in use: {0}")]
    NameTaken(String),

    #[error("Mount path already in use: {0:?}")]
    PathTaken(PathBuf),

    #[error("No such mount: {0}")]
    NotFound(String),

    #[error("Remote node {0} does not exist")]
    RemoteUnknown(NodeHandle),

    #[error("Remote node {0} is not a directory")]
    RemoteNotDirectory(NodeHandle),

    #[error("Invalid mount path {path:?}: {reason}")]
    LocalPath { path: PathBuf, reason: String },

    #[error("Mount is enabled: {0}")]
    Enabled(String),

    #[error("Mount is not enabled: {0}")]
    NotEnabled(String),

    #[error("Platform failed to mount: {0}")]
    Platform(String),

    #[error(transparent)]
    Storage(#[from] FsError),
}

impl From<DbError> for MountError {
    fn from(error: DbError) -> Self {
        MountError::Storage(error.into())
    }
}
