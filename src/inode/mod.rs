//! Inode Layer
//!
//! Local view of the remote tree. Every remote node the engine has seen is
//! represented by at most one live [`Inode`] with a stable [`InodeID`],
//! owned by the [`InodeDB`] arena and kept warm by the [`InodeCache`].

mod cache;
mod db;
mod id;
mod node;

pub use cache::InodeCache;
pub use db::InodeDB;
pub use id::InodeID;
pub use node::{validate_name, Inode, InodeInfo, InodeKind, InodeRef, MAX_NAME_LENGTH};
