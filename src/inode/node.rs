//! Inode objects
//!
//! An [`Inode`] caches what the engine knows about one remote file or
//! directory. Shape-changing operations (create, unlink, rename) live here
//! and take the [`InodeDB`] as a parameter, so inodes never hold a
//! reference back to the arena that owns them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::{InodeDB, InodeID};
use crate::cache::FileInfo;
use crate::error::{FsError, Result};
use crate::lock::{lock_all, SharedGuard, SharedMutex, UniqueGuard};
use crate::remote::{AccessLevel, NodeHandle, NodeInfo};

/// Longest name a directory entry may have, in bytes
pub const MAX_NAME_LENGTH: usize = 255;

/// Shared reference to a live inode
pub type InodeRef = Arc<Inode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

/// Attribute snapshot of an inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeInfo {
    pub id: InodeID,
    pub name: String,
    pub parent: Option<InodeID>,
    pub kind: InodeKind,
    pub size: u64,
    pub modified: SystemTime,
    pub permissions: AccessLevel,
    pub handle: Option<NodeHandle>,
    pub removed: bool,
}

impl InodeInfo {
    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// Mutable inode attributes
pub(crate) struct InodeState {
    pub(crate) name: String,
    pub(crate) parent: Option<InodeID>,
    pub(crate) handle: Option<NodeHandle>,
    pub(crate) modified: SystemTime,
    pub(crate) permissions: AccessLevel,
    pub(crate) size: u64,
    pub(crate) removed: bool,
    pub(crate) accessed: Instant,
    /// Local content, once the file cache has opened the file
    pub(crate) file: Option<Arc<FileInfo>>,
    /// Local content differs from the remote copy
    pub(crate) local_modified: bool,
    /// Directory entries by name, once the directory has been listed
    entries: Option<BTreeMap<String, InodeID>>,
    /// Bumped on every entry change, listed or not
    entries_version: u64,
}

/// One cached file or directory
pub struct Inode {
    id: InodeID,
    kind: InodeKind,
    lock: SharedMutex,
    state: Mutex<InodeState>,
}

/// Check a directory entry name before any remote call is made
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(FsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

impl Inode {
    /// Inode describing a remote node
    pub(crate) fn from_node(id: InodeID, info: &NodeInfo, parent: Option<InodeID>) -> Self {
        let kind = if info.is_directory {
            InodeKind::Directory
        } else {
            InodeKind::File
        };

        Self::with_state(
            id,
            kind,
            InodeState {
                name: info.name.clone(),
                parent,
                handle: Some(info.handle),
                modified: info.modified,
                permissions: info.permissions,
                size: info.size,
                removed: false,
                accessed: Instant::now(),
                file: None,
                local_modified: false,
                entries: None,
                entries_version: 0,
            },
        )
    }

    /// File that does not exist remotely yet
    pub(crate) fn local_file(id: InodeID, name: &str, parent: Option<InodeID>) -> Self {
        Self::with_state(
            id,
            InodeKind::File,
            InodeState {
                name: name.to_string(),
                parent,
                handle: None,
                modified: SystemTime::now(),
                permissions: AccessLevel::Full,
                size: 0,
                removed: false,
                accessed: Instant::now(),
                file: None,
                local_modified: true,
                entries: None,
                entries_version: 0,
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn detached_file(id: InodeID, name: &str) -> Self {
        Self::local_file(id, name, None)
    }

    fn with_state(id: InodeID, kind: InodeKind, state: InodeState) -> Self {
        Self {
            id,
            kind,
            lock: SharedMutex::new(),
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> InodeID {
        self.id
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn parent(&self) -> Option<InodeID> {
        self.state.lock().parent
    }

    pub fn handle(&self) -> Option<NodeHandle> {
        self.state.lock().handle
    }

    pub fn removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn permissions(&self) -> AccessLevel {
        self.state.lock().permissions
    }

    /// When the inode was last used
    pub fn accessed(&self) -> Instant {
        self.state.lock().accessed
    }

    /// Record a use of the inode
    pub fn touch_accessed(&self) {
        self.state.lock().accessed = Instant::now();
    }

    /// Whether local content waits to be uploaded
    pub fn local_modified(&self) -> bool {
        self.state.lock().local_modified
    }

    /// Current attributes
    ///
    /// Removed inodes keep their last known attributes.
    pub fn info(&self) -> InodeInfo {
        let state = self.state.lock();
        let (size, modified) = match &state.file {
            Some(file) if state.local_modified || file.source() == state.handle => {
                (file.size(), file.modified())
            }
            _ => (state.size, state.modified),
        };

        InodeInfo {
            id: self.id,
            name: state.name.clone(),
            parent: state.parent,
            kind: self.kind,
            size,
            modified,
            permissions: state.permissions,
            handle: state.handle,
            removed: state.removed,
        }
    }

    /// Exclusive hold on the inode
    pub fn lock(&self) -> UniqueGuard<'_> {
        self.lock.lock()
    }

    /// Shared hold on the inode
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        self.lock.lock_shared()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    /// Local content record, if the file cache has one
    pub fn file_info(&self) -> Option<Arc<FileInfo>> {
        self.state.lock().file.clone()
    }

    pub(crate) fn set_file_info(&self, file: Arc<FileInfo>) {
        self.state.lock().file = Some(file);
    }

    pub(crate) fn set_local_modified(&self, modified: bool) {
        self.state.lock().local_modified = modified;
    }

    /// Take in fresh remote attributes
    ///
    /// Size and modification time are left alone while local changes are pending.
    pub(crate) fn refresh(&self, info: &NodeInfo, parent: Option<InodeID>) {
        let mut state = self.state.lock();
        state.name = info.name.clone();
        state.permissions = info.permissions;
        if parent.is_some() {
            state.parent = parent;
        }
        if !state.local_modified {
            state.size = info.size;
            state.modified = info.modified;
        }
    }

    fn expect_directory(&self) -> Result<()> {
        if !self.is_directory() {
            return Err(FsError::NotADirectory(self.name()));
        }
        Ok(())
    }

    fn expect_present(&self) -> Result<()> {
        if self.removed() {
            return Err(FsError::NotFound(self.name()));
        }
        Ok(())
    }

    fn expect_writable(&self) -> Result<()> {
        if !self.permissions().writable() {
            return Err(FsError::PermissionDenied(self.name()));
        }
        Ok(())
    }

    fn remote_handle(&self) -> Result<NodeHandle> {
        self.handle()
            .ok_or_else(|| FsError::Internal(format!("{} has no remote node", self.id)))
    }

    /// Run `f` over the directory entries, listing the remote once if needed
    ///
    /// Later lookups are answered from the entries without contacting the
    /// remote, until [`Inode::forget_entries`] drops them.
    fn with_entries<T>(
        &self,
        db: &InodeDB,
        f: impl FnOnce(&BTreeMap<String, InodeID>) -> T,
    ) -> Result<T> {
        self.expect_directory()?;
        self.expect_present()?;

        loop {
            let version = {
                let state = self.state.lock();
                if let Some(entries) = &state.entries {
                    return Ok(f(entries));
                }
                state.entries_version
            };

            let entries = self.list(db)?;

            let mut state = self.state.lock();
            if state.entries.is_none() && state.entries_version == version {
                let result = f(&entries);
                state.entries = Some(entries);
                return Ok(result);
            }
            // Changed while listing; take the newer view.
        }
    }

    fn list(&self, db: &InodeDB) -> Result<BTreeMap<String, InodeID>> {
        let handle = self.remote_handle()?;
        let listing = db.block_on(db.client().each(handle))?;

        let mut entries = BTreeMap::new();
        for info in listing {
            let child = db.materialize(info, Some(self.id));
            if !child.removed() && child.parent() == Some(self.id) {
                entries.insert(child.name(), child.id());
            }
        }
        for child in db.local_children(self.id) {
            entries.insert(child.name(), child.id());
        }

        debug!(id = %self.id, entries = entries.len(), "Listed directory");
        Ok(entries)
    }

    pub(crate) fn add_entry(&self, name: &str, id: InodeID) {
        let mut state = self.state.lock();
        state.entries_version += 1;
        if let Some(entries) = state.entries.as_mut() {
            entries.insert(name.to_string(), id);
        }
    }

    pub(crate) fn remove_entry(&self, name: &str, id: InodeID) {
        let mut state = self.state.lock();
        state.entries_version += 1;
        if let Some(entries) = state.entries.as_mut() {
            if entries.get(name) == Some(&id) {
                entries.remove(name);
            }
        }
    }

    /// Drop the cached entries; the next lookup lists the remote again
    pub fn forget_entries(&self) {
        let mut state = self.state.lock();
        state.entries_version += 1;
        state.entries = None;
    }

    /// Whether the entries are cached
    pub fn listed(&self) -> bool {
        self.state.lock().entries.is_some()
    }

    /// Children of a directory, in name order
    pub fn children(&self, db: &InodeDB) -> Result<Vec<InodeRef>> {
        let ids: Vec<InodeID> = self.with_entries(db, |entries| entries.values().copied().collect())?;

        let mut children = Vec::with_capacity(ids.len());
        for id in ids {
            match db.get(id) {
                Ok(child) if !child.removed() && child.parent() == Some(self.id) => {
                    children.push(child)
                }
                Ok(_) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(children)
    }

    pub fn has_children(&self, db: &InodeDB) -> Result<bool> {
        self.with_entries(db, |entries| !entries.is_empty())
    }

    /// Whether an entry named `name` exists
    pub fn contains(&self, db: &InodeDB, name: &str) -> Result<bool> {
        self.with_entries(db, |entries| entries.contains_key(name))
    }

    /// Child named `name`, if there is one
    pub fn find_child(&self, db: &InodeDB, name: &str) -> Result<Option<InodeRef>> {
        let Some(id) = self.with_entries(db, |entries| entries.get(name).copied())? else {
            return Ok(None);
        };

        match db.get(id) {
            Ok(child) if !child.removed() => Ok(Some(child)),
            Ok(_) | Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Child named `name`
    pub fn child(&self, db: &InodeDB, name: &str) -> Result<InodeRef> {
        validate_name(name)?;
        self.find_child(db, name)?
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    fn check_create(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.expect_directory()?;
        self.expect_present()?;
        self.expect_writable()
    }

    /// Create a remote directory under this one
    pub fn make_directory(&self, db: &InodeDB, name: &str) -> Result<InodeRef> {
        self.check_create(name)?;
        let _guard = self.lock();

        if self.contains(db, name)? {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let info = db.block_on(db.client().make_directory(self.remote_handle()?, name))?;
        let directory = db.materialize(info, Some(self.id));
        directory.state().entries.get_or_insert_with(BTreeMap::new);
        self.add_entry(name, directory.id());

        debug!(parent = %self.id, id = %directory.id(), name = name, "Created directory");
        Ok(directory)
    }

    /// Create an empty file that exists only locally until its first flush
    pub fn make_file(&self, db: &InodeDB, name: &str) -> Result<InodeRef> {
        self.check_create(name)?;
        let _guard = self.lock();

        if self.contains(db, name)? {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let file = db.make_local_file(self, name)?;
        self.add_entry(name, file.id());
        debug!(parent = %self.id, id = %file.id(), name = name, "Created local file");
        Ok(file)
    }

    /// Remove the file named `name`
    ///
    /// # Returns
    /// The removed inode, now marked removed
    pub fn unlink(&self, db: &InodeDB, name: &str) -> Result<InodeRef> {
        self.expect_writable()?;
        let child = self.child(db, name)?;
        if child.is_directory() {
            return Err(FsError::IsADirectory(name.to_string()));
        }

        let guards = lock_all(&[&self.lock, &child.lock]);
        child.expect_present()?;

        if let Some(handle) = child.handle() {
            db.block_on(db.client().remove(handle))?;
        }
        db.removed(&child);
        drop(guards);

        debug!(parent = %self.id, id = %child.id(), name = name, "Unlinked file");
        Ok(child)
    }

    /// Remove the empty directory named `name`
    ///
    /// # Returns
    /// The removed inode, now marked removed
    pub fn remove_directory(&self, db: &InodeDB, name: &str) -> Result<InodeRef> {
        self.expect_writable()?;
        let child = self.child(db, name)?;
        if !child.is_directory() {
            return Err(FsError::NotADirectory(name.to_string()));
        }

        let guards = lock_all(&[&self.lock, &child.lock]);
        child.expect_present()?;

        if child.has_children(db)? {
            return Err(FsError::NotEmpty(name.to_string()));
        }

        db.block_on(db.client().remove(child.remote_handle()?))?;
        db.removed(&child);
        drop(guards);

        debug!(parent = %self.id, id = %child.id(), name = name, "Removed directory");
        Ok(child)
    }

    /// Whether `ancestor` is this inode or one of its parents
    fn descends_from(&self, db: &InodeDB, ancestor: InodeID) -> Result<bool> {
        let mut current = Some(self.id);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = db.get(id)?.parent();
        }
        Ok(false)
    }

    /// Move this inode to `new_parent` under `new_name`, replacing what is there
    ///
    /// # Returns
    /// The replaced inode, if the move displaced one
    pub fn move_to(
        self: &InodeRef,
        db: &InodeDB,
        new_parent: &InodeRef,
        new_name: &str,
    ) -> Result<Option<InodeRef>> {
        validate_name(new_name)?;
        new_parent.expect_directory()?;
        new_parent.expect_present()?;
        new_parent.expect_writable()?;
        self.expect_present()?;

        let old_parent = match self.parent() {
            Some(parent) => db.get(parent)?,
            None => return Err(FsError::InvalidArgument("cannot move a root".into())),
        };

        if self.is_directory() && new_parent.descends_from(db, self.id)? {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} below itself",
                self.name()
            )));
        }

        let mut locks: Vec<&Inode> = vec![&**self, &*old_parent, &**new_parent];
        locks.sort_by_key(|inode| inode.id);
        locks.dedup_by_key(|inode| inode.id);
        let mutexes: Vec<&SharedMutex> = locks.iter().map(|inode| &inode.lock).collect();
        let _guards = lock_all(&mutexes[..]);

        let mut replaced = None;
        if let Some(target) = new_parent.find_child(db, new_name)? {
            if target.id == self.id {
                return Ok(None);
            }

            match (self.is_directory(), target.is_directory()) {
                (true, false) => return Err(FsError::NotADirectory(new_name.to_string())),
                (false, true) => return Err(FsError::IsADirectory(new_name.to_string())),
                _ => {}
            }
            if target.is_directory() && target.has_children(db)? {
                return Err(FsError::NotEmpty(new_name.to_string()));
            }

            if let Some(handle) = target.handle() {
                db.block_on(db.client().remove(handle))?;
            }
            db.removed(&target);
            replaced = Some(target);
        }

        if let Some(handle) = self.handle() {
            if old_parent.id == new_parent.id {
                db.block_on(db.client().rename(handle, new_name))?;
            } else {
                let parent_handle = new_parent.remote_handle()?;
                db.block_on(db.client().move_to(handle, parent_handle, new_name))?;
            }
        }

        let old_name = {
            let mut state = self.state.lock();
            state.parent = Some(new_parent.id);
            std::mem::replace(&mut state.name, new_name.to_string())
        };
        old_parent.remove_entry(&old_name, self.id);
        new_parent.add_entry(new_name, self.id);
        db.moved(self)?;

        debug!(
            id = %self.id,
            from = %old_parent.id,
            to = %new_parent.id,
            name = new_name,
            "Moved inode"
        );
        Ok(replaced)
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &state.name)
            .field("handle", &state.handle)
            .field("removed", &state.removed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(matches!(validate_name(""), Err(FsError::InvalidArgument(_))));
        assert!(matches!(validate_name("a/b"), Err(FsError::InvalidArgument(_))));
        assert!(matches!(
            validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)),
            Err(FsError::NameTooLong(_))
        ));
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
    }

    #[test]
    fn test_refresh_keeps_local_changes() {
        let inode = Inode::detached_file(InodeID::new(9), "draft.txt");
        let info = NodeInfo {
            handle: NodeHandle(4),
            parent: None,
            name: "draft.txt".into(),
            is_directory: false,
            size: 1234,
            modified: SystemTime::UNIX_EPOCH,
            permissions: AccessLevel::ReadOnly,
        };

        inode.refresh(&info, None);
        let snapshot = inode.info();
        assert_eq!(snapshot.size, 0);
        assert_eq!(snapshot.permissions, AccessLevel::ReadOnly);

        inode.set_local_modified(false);
        inode.refresh(&info, None);
        assert_eq!(inode.info().size, 1234);
    }
}
