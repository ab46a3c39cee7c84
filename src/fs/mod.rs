//! FUSE filesystem implementation

pub mod attr;
mod fuse;
mod handles;
pub mod inode;
mod session;

pub use fuse::FuseFilesystem;
pub use handles::HandleTable;
pub use inode::{InoMap, ROOT_INO};
pub use session::{FuseInvalidator, FusePlatform};
