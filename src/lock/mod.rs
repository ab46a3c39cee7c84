//! Locking primitives
//!
//! The upgradeable shared mutex guarding inodes and file contexts, and the
//! lock-set helper used when an operation spans several of them.

mod lock_set;
mod shared_mutex;

pub use lock_set::{lock_all, Lockable};
pub use shared_mutex::{SharedGuard, SharedMutex, UniqueGuard};
