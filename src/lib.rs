//! CloudMount Engine - local caching and concurrency engine for cloud mounts
//!
//! Exposes a remote content tree as a mountable filesystem. Content is
//! cached on disk, fetched in ranges on demand and written back after a
//! debounce delay.

pub mod cache;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod fs;
pub mod inode;
pub mod lock;
pub mod mount;
pub mod range;
pub mod remote;
pub mod service;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServiceConfig;
pub use error::{FsError, Result};
pub use service::Service;
