//! Engine Error Types
//!
//! Structured error handling for filesystem operations.
//! Every variant maps onto a libc errno for the platform shim.

use std::io;
use std::sync::Arc;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, FsError>;

/// Filesystem error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Name too long: {0}")]
    NameTooLong(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Read-only")]
    ReadOnly,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl FsError {
    /// Map the error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::ReadOnly => libc::EROFS,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::Network(_) => libc::EIO,
            FsError::Cancelled => libc::ECANCELED,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Internal(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Network(_))
    }

    /// Whether this error reports a cancelled operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FsError::Cancelled)
    }
}

impl From<io::Error> for FsError {
    fn from(error: io::Error) -> Self {
        FsError::Io(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotEmpty("d".into()).to_errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(FsError::NameTooLong("x".into()).to_errno(), libc::ENAMETOOLONG);

        let io = FsError::from(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(io.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_retryable() {
        assert!(FsError::Network("reset".into()).is_retryable());
        assert!(!FsError::NotFound("x".into()).is_retryable());
        assert!(!FsError::Cancelled.is_retryable());
    }
}
