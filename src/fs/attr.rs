//! Kernel attribute conversion

use std::time::Duration;

use fuser::{FileAttr, FileType};

use crate::inode::InodeInfo;

/// TTL for attributes and entries handed to the kernel
pub const TTL: Duration = Duration::from_secs(1);

/// Block size reported to the kernel
const BLOCK_SIZE: u32 = 4096;

/// Convert engine attributes to a FUSE attribute record
///
/// # Arguments
/// * `ino` - Kernel inode number for the entry
/// * `writable` - Whether writes are allowed through the mount
pub fn to_file_attr(ino: u64, info: &InodeInfo, writable: bool) -> FileAttr {
    let is_dir = info.is_directory();
    let kind = if is_dir {
        FileType::Directory
    } else {
        FileType::RegularFile
    };

    let writable = writable && info.permissions.writable();
    let perm = match (is_dir, writable) {
        (true, true) => 0o755,
        (true, false) => 0o555,
        (false, true) => 0o644,
        (false, false) => 0o444,
    };

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    FileAttr {
        ino,
        size: info.size,
        // 512-byte blocks as per POSIX
        blocks: info.size.div_ceil(512),
        atime: info.modified,
        mtime: info.modified,
        ctime: info.modified,
        crtime: info.modified,
        kind,
        perm,
        nlink: if is_dir { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn file_type(info: &InodeInfo) -> FileType {
    if info.is_directory() {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{InodeID, InodeKind};
    use crate::remote::AccessLevel;
    use std::time::SystemTime;

    fn info(kind: InodeKind, permissions: AccessLevel) -> InodeInfo {
        InodeInfo {
            id: InodeID::new(4),
            name: "x".into(),
            parent: None,
            kind,
            size: 1025,
            modified: SystemTime::UNIX_EPOCH,
            permissions,
            handle: None,
            removed: false,
        }
    }

    #[test]
    fn test_permissions_follow_mount_and_remote() {
        let file = to_file_attr(9, &info(InodeKind::File, AccessLevel::Full), true);
        assert_eq!(file.perm, 0o644);
        assert_eq!(file.blocks, 3);
        assert_eq!(file.kind, FileType::RegularFile);

        let read_only = to_file_attr(9, &info(InodeKind::File, AccessLevel::ReadOnly), true);
        assert_eq!(read_only.perm, 0o444);

        let dir = to_file_attr(1, &info(InodeKind::Directory, AccessLevel::Full), false);
        assert_eq!(dir.perm, 0o555);
        assert_eq!(dir.nlink, 2);
    }
}
