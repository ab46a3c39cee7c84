//! Mounted volumes
//!
//! A [`Mount`] exposes one remote directory as a filesystem root. It is
//! the only surface platform shims talk to: every request names inodes by
//! id, and the mount resolves them, enforces its flags and fans out the
//! resulting invalidations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{Invalidator, MountDescriptor, MountFlags};
use crate::cache::{FileCache, FileIOContext};
use crate::error::{FsError, Result};
use crate::inode::{InodeDB, InodeID, InodeInfo, InodeRef};

/// An open file handle
pub struct OpenFile {
    context: Arc<FileIOContext>,
    writable: bool,
}

impl OpenFile {
    pub fn id(&self) -> InodeID {
        self.context.id()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn context(&self) -> &Arc<FileIOContext> {
        &self.context
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("id", &self.id())
            .field("writable", &self.writable)
            .finish()
    }
}

/// One enabled mount
pub struct Mount {
    descriptor: Mutex<MountDescriptor>,
    root: InodeRef,
    inodes: Arc<InodeDB>,
    files: Arc<FileCache>,
    invalidator: Arc<dyn Invalidator>,
}

impl Mount {
    pub fn new(
        descriptor: MountDescriptor,
        root: InodeRef,
        inodes: Arc<InodeDB>,
        files: Arc<FileCache>,
        invalidator: Arc<dyn Invalidator>,
    ) -> Self {
        Self {
            descriptor: Mutex::new(descriptor),
            root,
            inodes,
            files,
            invalidator,
        }
    }

    pub fn name(&self) -> String {
        self.descriptor.lock().name.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.descriptor.lock().path.clone()
    }

    pub fn descriptor(&self) -> MountDescriptor {
        self.descriptor.lock().clone()
    }

    pub fn flags(&self) -> MountFlags {
        self.descriptor.lock().flags
    }

    pub(crate) fn set_flags(&self, flags: MountFlags) {
        self.descriptor.lock().flags = flags;
    }

    /// Whether changes are allowed through this mount
    pub fn writable(&self) -> bool {
        !self.flags().read_only
    }

    pub fn root(&self) -> &InodeRef {
        &self.root
    }

    pub fn root_id(&self) -> InodeID {
        self.root.id()
    }

    pub fn inodes(&self) -> &Arc<InodeDB> {
        &self.inodes
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// Live inode for `id`
    pub fn inode(&self, id: InodeID) -> Result<InodeRef> {
        if id == self.root.id() {
            return Ok(Arc::clone(&self.root));
        }
        let inode = self.inodes.get(id)?;
        if inode.removed() {
            return Err(FsError::NotFound(format!("inode {}", id)));
        }
        Ok(inode)
    }

    pub fn lookup(&self, parent: InodeID, name: &str) -> Result<InodeInfo> {
        let child = self.inode(parent)?.child(&self.inodes, name)?;
        child.touch_accessed();
        Ok(child.info())
    }

    pub fn getattr(&self, id: InodeID) -> Result<InodeInfo> {
        Ok(self.inode(id)?.info())
    }

    /// Attributes of every entry in directory `id`, sorted by name
    pub fn readdir(&self, id: InodeID) -> Result<Vec<InodeInfo>> {
        let children = self.inode(id)?.children(&self.inodes)?;
        Ok(children.iter().map(|child| child.info()).collect())
    }

    pub fn make_directory(&self, parent: InodeID, name: &str) -> Result<InodeInfo> {
        self.check_writable()?;
        let directory = self.inode(parent)?.make_directory(&self.inodes, name)?;
        self.invalidator.attributes(parent);
        Ok(directory.info())
    }

    /// Create an empty file; it is uploaded on its first flush
    pub fn make_file(&self, parent: InodeID, name: &str) -> Result<InodeInfo> {
        self.check_writable()?;
        let file = self.inode(parent)?.make_file(&self.inodes, name)?;
        self.invalidator.attributes(parent);
        Ok(file.info())
    }

    pub fn unlink(&self, parent: InodeID, name: &str) -> Result<()> {
        self.check_writable()?;
        let removed = self.inode(parent)?.unlink(&self.inodes, name)?;
        self.files.remove(&removed);
        self.invalidator.entry(parent, name);
        Ok(())
    }

    pub fn remove_directory(&self, parent: InodeID, name: &str) -> Result<()> {
        self.check_writable()?;
        self.inode(parent)?.remove_directory(&self.inodes, name)?;
        self.invalidator.entry(parent, name);
        Ok(())
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing what is there
    pub fn rename(
        &self,
        parent: InodeID,
        name: &str,
        new_parent: InodeID,
        new_name: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let source = self.inode(parent)?.child(&self.inodes, name)?;
        let target = self.inode(new_parent)?;

        if let Some(replaced) = source.move_to(&self.inodes, &target, new_name)? {
            self.files.remove(&replaced);
        }

        self.invalidator.entry(parent, name);
        self.invalidator.entry(new_parent, new_name);
        debug!(from = name, to = new_name, "Renamed entry");
        Ok(())
    }

    /// Open file `id`
    ///
    /// # Arguments
    /// * `write` - The handle will be used for writing
    /// * `truncate` - Discard the content first
    pub fn open(&self, id: InodeID, write: bool, truncate: bool) -> Result<OpenFile> {
        if write || truncate {
            self.check_writable()?;
        }

        let inode = self.inode(id)?;
        if inode.is_directory() {
            return Err(FsError::IsADirectory(inode.name()));
        }
        if (write || truncate) && !inode.permissions().writable() {
            return Err(FsError::PermissionDenied(inode.name()));
        }

        let context = self.files.context(&inode);
        context.open(truncate)?;
        Ok(OpenFile {
            context,
            writable: write || truncate,
        })
    }

    pub fn read(&self, file: &OpenFile, offset: u64, size: u64) -> Result<Bytes> {
        file.context.read(offset, size)
    }

    pub fn write(&self, file: &OpenFile, offset: u64, data: &[u8]) -> Result<usize> {
        if !file.writable {
            return Err(FsError::PermissionDenied("handle not open for writing".into()));
        }
        self.check_writable()?;
        file.context.write(offset, data, false)
    }

    /// Change the size of file `id`
    pub fn set_size(&self, id: InodeID, size: u64) -> Result<InodeInfo> {
        self.check_writable()?;
        let inode = self.inode(id)?;
        if inode.is_directory() {
            return Err(FsError::IsADirectory(inode.name()));
        }

        let context = self.files.context(&inode);
        context.open(false)?;
        context.truncate(size, false)?;
        Ok(inode.info())
    }

    /// Change the modification time of file `id`
    pub fn set_modified(&self, id: InodeID, modified: SystemTime) -> Result<InodeInfo> {
        self.check_writable()?;
        let inode = self.inode(id)?;
        if inode.is_directory() {
            let handle = inode
                .handle()
                .ok_or_else(|| FsError::Internal(format!("{} has no remote node", id)))?;
            self.inodes.block_on(self.inodes.client().touch(handle, modified))?;
            inode.state().modified = modified;
            self.invalidator.attributes(id);
            return Ok(inode.info());
        }

        let context = self.files.context(&inode);
        context.open(false)?;
        context.touch(modified)?;
        Ok(inode.info())
    }

    /// Upload pending changes of an open file now
    pub fn flush(&self, file: &OpenFile) -> Result<()> {
        if !file.context.flush_needed() {
            return Ok(());
        }
        file.context.manual_flush()
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("descriptor", &*self.descriptor.lock())
            .field("root", &self.root.id())
            .finish()
    }
}
