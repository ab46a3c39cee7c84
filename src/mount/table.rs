//! Mount table
//!
//! Persists mount descriptors and tracks which mounts are enabled. An
//! enabled mount owns a platform session and a registration with the
//! invalidation hub; disabling it flushes pending writes first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    HubToken, InvalidationHub, Invalidator, Mount, MountDescriptor, MountError, MountFlags,
    Platform, Session,
};
use crate::cache::FileCache;
use crate::db::Database;
use crate::error::FsError;
use crate::inode::{InodeDB, InodeRef};
use crate::remote::NodeHandle;

struct Enabled {
    mount: Arc<Mount>,
    session: Session,
    token: HubToken,
}

#[derive(Default)]
struct TableState {
    enabled: HashMap<String, Enabled>,
    by_path: HashMap<PathBuf, String>,
}

/// Known mounts, persisted, and the enabled subset
pub struct MountTable {
    database: Arc<Database>,
    inodes: Arc<InodeDB>,
    files: Arc<FileCache>,
    hub: Arc<InvalidationHub>,
    platform: Arc<dyn Platform>,
    state: Mutex<TableState>,
}

impl MountTable {
    pub fn new(
        database: Arc<Database>,
        inodes: Arc<InodeDB>,
        files: Arc<FileCache>,
        hub: Arc<InvalidationHub>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            database,
            inodes,
            files,
            hub,
            platform,
            state: Mutex::new(TableState::default()),
        }
    }

    /// Root inode of remote directory `handle`
    ///
    /// Always asks the remote, so a directory that vanished is noticed even
    /// while its inode is cached.
    fn remote_root(&self, handle: NodeHandle) -> Result<InodeRef, MountError> {
        let node = self
            .inodes
            .block_on(self.inodes.client().get(handle))
            .map_err(|e| match e {
                FsError::NotFound(_) => MountError::RemoteUnknown(handle),
                other => MountError::Storage(other),
            })?;

        if !node.is_directory {
            return Err(MountError::RemoteNotDirectory(handle));
        }
        let parent = node.parent.map(|parent| self.inodes.id_for_handle(parent));
        Ok(self.inodes.materialize(node, parent))
    }

    fn check_descriptor(&self, descriptor: &MountDescriptor) -> Result<(), MountError> {
        if descriptor.name.trim().is_empty() {
            return Err(MountError::NoName);
        }
        if descriptor.path.as_os_str().is_empty() {
            return Err(MountError::LocalPath {
                path: descriptor.path.clone(),
                reason: "path is empty".into(),
            });
        }
        if descriptor.path.is_relative() {
            return Err(MountError::LocalPath {
                path: descriptor.path.clone(),
                reason: "path must be absolute".into(),
            });
        }
        Ok(())
    }

    /// Names of other mounts that clash with `descriptor`
    fn check_unused(&self, descriptor: &MountDescriptor, except: Option<&str>) -> Result<(), MountError> {
        for existing in self.database.mounts() {
            if Some(existing.name.as_str()) == except {
                continue;
            }
            if existing.name == descriptor.name {
                return Err(MountError::NameTaken(descriptor.name.clone()));
            }
            if existing.path == descriptor.path {
                return Err(MountError::PathTaken(descriptor.path.clone()));
            }
        }
        Ok(())
    }

    /// Register a new mount
    pub fn add(&self, descriptor: MountDescriptor) -> Result<(), MountError> {
        self.check_descriptor(&descriptor)?;
        // Remote check first, without holding the table lock.
        self.remote_root(descriptor.handle)?;

        let _state = self.state.lock();
        self.check_unused(&descriptor, None)?;
        self.database.put_mount(&descriptor.name, descriptor.clone())?;

        info!(
            mount = %descriptor.name,
            path = %descriptor.path.display(),
            handle = %descriptor.handle,
            "Mount added"
        );
        Ok(())
    }

    /// Forget a disabled mount
    pub fn remove(&self, name: &str) -> Result<(), MountError> {
        let state = self.state.lock();
        if state.enabled.contains_key(name) {
            return Err(MountError::Enabled(name.to_string()));
        }
        if !self.database.remove_mount(name)? {
            return Err(MountError::NotFound(name.to_string()));
        }

        drop(state);
        info!(mount = name, "Mount removed");
        Ok(())
    }

    /// Replace the descriptor of a disabled mount, possibly renaming it
    pub fn update(&self, name: &str, descriptor: MountDescriptor) -> Result<(), MountError> {
        self.check_descriptor(&descriptor)?;
        if descriptor.handle != self.get(name).ok_or_else(|| MountError::NotFound(name.into()))?.handle {
            self.remote_root(descriptor.handle)?;
        }

        let state = self.state.lock();
        if state.enabled.contains_key(name) {
            return Err(MountError::Enabled(name.to_string()));
        }
        self.check_unused(&descriptor, Some(name))?;

        self.database.transaction(|document| {
            document.mounts.retain(|mount| mount.name != name);
            document.mounts.push(descriptor.clone());
        })?;
        drop(state);

        debug!(mount = name, new_name = %descriptor.name, "Mount updated");
        Ok(())
    }

    /// Change the flags of a mount; `read_only` takes effect immediately
    pub fn set_flags(&self, name: &str, flags: MountFlags) -> Result<(), MountError> {
        let state = self.state.lock();
        let mut descriptor = self
            .database
            .mount(name)
            .ok_or_else(|| MountError::NotFound(name.to_string()))?;

        descriptor.flags = flags;
        self.database.put_mount(name, descriptor)?;
        if let Some(enabled) = state.enabled.get(name) {
            enabled.mount.set_flags(flags);
        }
        Ok(())
    }

    /// Present a mount to the platform
    ///
    /// # Arguments
    /// * `remember` - Also enable it at every startup
    pub fn enable(&self, name: &str, remember: bool) -> Result<Arc<Mount>, MountError> {
        let descriptor = self
            .database
            .mount(name)
            .ok_or_else(|| MountError::NotFound(name.to_string()))?;
        if self.enabled(name) {
            return Err(MountError::Enabled(name.to_string()));
        }

        let root = self.remote_root(descriptor.handle)?;
        let mount = Arc::new(Mount::new(
            descriptor.clone(),
            root,
            Arc::clone(&self.inodes),
            Arc::clone(&self.files),
            Arc::clone(&self.hub) as Arc<dyn Invalidator>,
        ));

        let session = self.platform.mount(Arc::clone(&mount))?;

        {
            let mut state = self.state.lock();
            if state.enabled.contains_key(name) {
                // Lost a race with another enable; our session is dropped.
                return Err(MountError::Enabled(name.to_string()));
            }
            let token = self.hub.register(session.invalidator());
            state.by_path.insert(descriptor.path.clone(), name.to_string());
            state.enabled.insert(
                name.to_string(),
                Enabled {
                    mount: Arc::clone(&mount),
                    session,
                    token,
                },
            );
        }

        if remember && !descriptor.flags.enable_at_startup {
            let mut flags = descriptor.flags;
            flags.enable_at_startup = true;
            self.set_flags(name, flags)?;
        }

        info!(mount = name, path = %descriptor.path.display(), "Mount enabled");
        Ok(mount)
    }

    /// Withdraw a mount from the platform after flushing its writes
    ///
    /// # Arguments
    /// * `remember` - Also stop enabling it at startup
    pub fn disable(&self, name: &str, remember: bool) -> Result<(), MountError> {
        let enabled = {
            let mut state = self.state.lock();
            let enabled = state
                .enabled
                .remove(name)
                .ok_or_else(|| MountError::NotEnabled(name.to_string()))?;
            state.by_path.remove(&enabled.mount.path());
            enabled
        };

        let failed = self.files.flush_all();
        if failed > 0 {
            warn!(mount = name, failed = failed, "Pending writes left unflushed at disable");
        }

        self.hub.unregister(enabled.token);
        drop(enabled.session);

        if let Some(mut descriptor) = self.database.mount(name) {
            if !descriptor.flags.persistent {
                self.database.remove_mount(name)?;
            } else if remember && descriptor.flags.enable_at_startup {
                descriptor.flags.enable_at_startup = false;
                self.database.put_mount(name, descriptor)?;
            }
        }

        info!(mount = name, "Mount disabled");
        Ok(())
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.state.lock().enabled.contains_key(name)
    }

    /// Descriptor of mount `name`
    pub fn get(&self, name: &str) -> Option<MountDescriptor> {
        self.database.mount(name)
    }

    /// Descriptors of every mount, or only of the enabled ones
    pub fn list(&self, only_enabled: bool) -> Vec<MountDescriptor> {
        let mut descriptors = self.database.mounts();
        if only_enabled {
            let state = self.state.lock();
            descriptors.retain(|descriptor| state.enabled.contains_key(&descriptor.name));
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Enabled mount `name`
    pub fn mount(&self, name: &str) -> Option<Arc<Mount>> {
        self.state
            .lock()
            .enabled
            .get(name)
            .map(|enabled| Arc::clone(&enabled.mount))
    }

    /// Enabled mount at `path`
    pub fn mount_at(&self, path: &Path) -> Option<Arc<Mount>> {
        let state = self.state.lock();
        let name = state.by_path.get(path)?;
        state.enabled.get(name).map(|enabled| Arc::clone(&enabled.mount))
    }

    /// Call `f` for every enabled mount, outside the table lock
    pub fn each<F: FnMut(&Arc<Mount>)>(&self, mut f: F) {
        let mounts: Vec<Arc<Mount>> = self
            .state
            .lock()
            .enabled
            .values()
            .map(|enabled| Arc::clone(&enabled.mount))
            .collect();
        for mount in &mounts {
            f(mount);
        }
    }

    /// Drop non-persistent leftovers and enable the mounts flagged for startup
    ///
    /// # Returns
    /// Number of mounts enabled
    pub fn enable_at_startup(&self) -> usize {
        let mut count = 0;
        for descriptor in self.database.mounts() {
            if !descriptor.flags.persistent {
                if let Err(e) = self.database.remove_mount(&descriptor.name) {
                    warn!(mount = %descriptor.name, error = %e, "Failed to prune mount");
                }
                continue;
            }
            if !descriptor.flags.enable_at_startup {
                continue;
            }

            match self.enable(&descriptor.name, false) {
                Ok(_) => count += 1,
                Err(e) => warn!(mount = %descriptor.name, error = %e, "Failed to enable mount at startup"),
            }
        }
        count
    }

    /// Re-check remote state and disable mounts whose root vanished
    ///
    /// # Returns
    /// Number of inodes found removed
    pub fn invalidate(&self) -> usize {
        let vanished = self.inodes.invalidate();
        for inode in &vanished {
            if let Some(parent) = inode.parent() {
                self.hub.entry(parent, &inode.name());
            }
            self.files.remove(inode);
        }

        let mut orphaned = Vec::new();
        self.each(|mount| {
            if mount.root().removed() {
                orphaned.push(mount.name());
            }
        });
        for name in orphaned {
            warn!(mount = %name, "Remote root vanished, disabling mount");
            if let Err(e) = self.disable(&name, false) {
                warn!(mount = %name, error = %e, "Failed to disable mount");
            }
        }

        vanished.len()
    }

    /// Disable every enabled mount
    pub fn disable_all(&self) {
        let names: Vec<String> = self.state.lock().enabled.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.disable(&name, false) {
                warn!(mount = %name, error = %e, "Failed to disable mount");
            }
        }
    }
}
