//! Local File Cache
//!
//! Owns the backing files of every cached inode and hands out exactly one
//! [`FileIOContext`] per inode at a time. Contexts are tracked weakly: a
//! context lives as long as an open handle or a pending flush holds it,
//! and deregisters itself when the last holder lets go.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{extension, FileIOContext, FileInfo};
use crate::config::{DownloadConfig, ServiceConfig};
use crate::inode::{InodeDB, InodeID, InodeRef};
use crate::mount::Invalidator;
use crate::remote::RemoteClient;
use crate::task::TaskExecutor;

#[derive(Default)]
struct CacheState {
    contexts: HashMap<InodeID, Weak<FileIOContext>>,
    infos: HashMap<InodeID, Weak<FileInfo>>,
}

/// Write-back cache of file content on local disk
pub struct FileCache {
    client: Arc<dyn RemoteClient>,
    runtime: Handle,
    executor: Arc<TaskExecutor>,
    inodes: Arc<InodeDB>,
    invalidator: Arc<dyn Invalidator>,
    root: PathBuf,
    flush_delay: Duration,
    download: DownloadConfig,
    state: Mutex<CacheState>,
    released: Condvar,
}

impl FileCache {
    /// Create the cache, making sure its directory exists
    ///
    /// # Arguments
    /// * `invalidator` - Receives attribute and data changes caused by writes
    /// * `config` - Supplies the cache directory, flush delay and download tuning
    pub fn new(
        client: Arc<dyn RemoteClient>,
        runtime: Handle,
        executor: Arc<TaskExecutor>,
        inodes: Arc<InodeDB>,
        invalidator: Arc<dyn Invalidator>,
        config: &ServiceConfig,
    ) -> Result<Arc<Self>> {
        let root = config.files_dir();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory: {:?}", root))?;

        info!(
            cache_dir = %root.display(),
            flush_delay_ms = config.flush_delay.as_millis() as u64,
            "File cache initialized"
        );

        Ok(Arc::new(Self {
            client,
            runtime,
            executor,
            inodes,
            invalidator,
            root,
            flush_delay: config.flush_delay,
            download: config.download,
            state: Mutex::new(CacheState::default()),
            released: Condvar::new(),
        }))
    }

    pub(crate) fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn inodes(&self) -> &Arc<InodeDB> {
        &self.inodes
    }

    pub(crate) fn invalidator(&self) -> &dyn Invalidator {
        self.invalidator.as_ref()
    }

    pub fn flush_delay(&self) -> Duration {
        self.flush_delay
    }

    pub(crate) fn download_config(&self) -> DownloadConfig {
        self.download
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backing file location for inode `id`
    pub fn path(&self, id: InodeID, extension: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, extension))
    }

    /// The single context for `inode`, created on first use
    pub fn context(self: &Arc<Self>, inode: &InodeRef) -> Arc<FileIOContext> {
        let mut state = self.state.lock();
        if let Some(context) = state.contexts.get(&inode.id()).and_then(Weak::upgrade) {
            return context;
        }

        let info = self.info_locked(&mut state, inode);
        let context = Arc::new(FileIOContext::new(Arc::clone(inode), info, Arc::clone(self)));
        state.contexts.insert(inode.id(), Arc::downgrade(&context));

        debug!(id = %inode.id(), "Created file context");
        context
    }

    /// Live context for `id`, if any
    pub fn live_context(&self, id: InodeID) -> Option<Arc<FileIOContext>> {
        self.state.lock().contexts.get(&id).and_then(Weak::upgrade)
    }

    /// The single local content record for `inode`
    pub fn info(&self, inode: &InodeRef) -> Arc<FileInfo> {
        let mut state = self.state.lock();
        self.info_locked(&mut state, inode)
    }

    fn info_locked(&self, state: &mut CacheState, inode: &InodeRef) -> Arc<FileInfo> {
        if let Some(info) = state.infos.get(&inode.id()).and_then(Weak::upgrade) {
            return info;
        }
        if let Some(info) = inode.file_info() {
            state.infos.insert(inode.id(), Arc::downgrade(&info));
            return info;
        }

        let attributes = inode.info();
        let path = self.path(inode.id(), &extension(&attributes.name));
        let size = match fs::metadata(&path) {
            Ok(metadata) if inode.local_modified() => metadata.len(),
            _ => attributes.size,
        };

        let info = Arc::new(FileInfo::new(
            inode.id(),
            extension(&attributes.name),
            path,
            size,
            attributes.modified,
        ));
        inode.set_file_info(Arc::clone(&info));
        state.infos.insert(inode.id(), Arc::downgrade(&info));
        info
    }

    /// Discard the local content of a removed inode
    ///
    /// A live context is told to drop its pending flush; its backing file
    /// goes away once the context is released.
    pub fn remove(&self, inode: &InodeRef) {
        let (context, info) = {
            let mut state = self.state.lock();
            let context = state.contexts.get(&inode.id()).and_then(Weak::upgrade);
            let info = state.infos.remove(&inode.id()).and_then(|info| info.upgrade());
            (context, info)
        };

        if let Some(context) = context {
            context.cancel(true);
            return;
        }

        let path = match info.or_else(|| inode.file_info()) {
            Some(info) => info.path().to_path_buf(),
            None => self.path(inode.id(), &extension(&inode.name())),
        };
        remove_backing(&path);
    }

    /// Called by a context as it is dropped
    pub(crate) fn release(&self, id: InodeID, removed: bool, path: &Path) {
        {
            let mut state = self.state.lock();
            let replaced = match state.contexts.get(&id) {
                Some(weak) if weak.strong_count() == 0 => {
                    state.contexts.remove(&id);
                    false
                }
                Some(_) => true,
                None => false,
            };

            if removed && !replaced {
                state.infos.remove(&id);
                remove_backing(path);
            }
        }

        debug!(id = %id, removed = removed, "Released file context");
        self.released.notify_all();
    }

    /// Every live context
    pub fn contexts(&self) -> Vec<Arc<FileIOContext>> {
        self.state
            .lock()
            .contexts
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Delete backing files that no pending upload refers to
    ///
    /// Called at startup, before any context exists.
    ///
    /// # Returns
    /// Number of backing files deleted
    pub fn current(&self) -> Result<usize> {
        let mut removed = 0;

        let database = self.inodes.database();
        database.batch(|| -> crate::error::Result<()> {
            for record in database.inodes() {
                if !record.pending() {
                    let path = self.path(record.id, &record.extension);
                    if path.exists() {
                        remove_backing(&path);
                        removed += 1;
                    }
                    self.inodes.forget(record.id)?;
                }
            }
            Ok(())
        })??;

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache directory: {:?}", self.root))?;
        for entry in entries {
            let entry = entry?;
            let keep = entry
                .file_name()
                .to_str()
                .and_then(parse_backing_name)
                .and_then(|id| self.inodes.persisted(id))
                .map_or(false, |record| record.pending());

            if !keep {
                remove_backing(&entry.path());
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed = removed, "Removed stale cache files");
        }
        Ok(removed)
    }

    /// Schedule uploads for content left unflushed by a previous run
    pub fn resume(self: &Arc<Self>, inodes: Vec<InodeRef>) -> usize {
        let mut resumed = 0;
        for inode in inodes {
            let context = self.context(&inode);
            match context.restore() {
                Ok(()) => resumed += 1,
                Err(e) => warn!(id = %inode.id(), error = %e, "Failed to resume upload"),
            }
        }
        resumed
    }

    /// Upload every pending change now
    ///
    /// # Returns
    /// Number of contexts that failed to flush
    pub fn flush_all(&self) -> usize {
        let mut failed = 0;
        for context in self.contexts() {
            if !context.flush_needed() {
                continue;
            }
            if let Err(e) = context.manual_flush() {
                warn!(id = %context.id(), error = %e, "Failed to flush file");
                failed += 1;
            }
        }
        failed
    }

    /// Cancel all flushes and wait for contexts to be released
    ///
    /// # Returns
    /// true if every context was released before `timeout`
    pub fn cancel_all(&self, timeout: Duration) -> bool {
        for context in self.contexts() {
            context.cancel(true);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            state.contexts.retain(|_, weak| weak.strong_count() > 0);
            if state.contexts.is_empty() {
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                warn!(live = state.contexts.len(), "File contexts still live after cancel");
                return false;
            }
        }
    }
}

/// Inode id from a backing file name such as `000000000000002a.txt`
fn parse_backing_name(name: &str) -> Option<InodeID> {
    let digits = name.get(..16)?;
    let rest = &name[16..];
    if !(rest.is_empty() || rest.starts_with('.')) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok().map(InodeID::new)
}

fn remove_backing(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed backing file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove backing file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InodeRecord;
    use crate::remote::memory::ROOT_HANDLE;
    use crate::testing::Harness;

    #[test]
    fn test_parse_backing_name() {
        assert_eq!(parse_backing_name("000000000000002a.txt"), Some(InodeID::new(42)));
        assert_eq!(parse_backing_name("000000000000002a"), Some(InodeID::new(42)));
        assert_eq!(parse_backing_name("000000000000002ax"), None);
        assert_eq!(parse_backing_name("short"), None);
    }

    #[test]
    fn test_one_context_per_inode() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "a.txt", &b"abc"[..]);
        let inode = harness.child("a.txt");

        let first = harness.files.context(&inode);
        let second = harness.files.context(&inode);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.file().path().ends_with(format!("{}.txt", inode.id())));

        drop(first);
        drop(second);
        assert!(harness.files.live_context(inode.id()).is_none());
        assert!(harness.files.contexts().is_empty());
    }

    #[test]
    fn test_concurrent_opens_share_a_context() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "a", &b"abc"[..]);
        let inode = harness.child("a");

        let contexts: Vec<Arc<FileIOContext>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| harness.files.context(&inode)))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert!(contexts.iter().all(|context| Arc::ptr_eq(context, &contexts[0])));
    }

    #[test]
    fn test_startup_deletes_unreferenced_files() {
        let harness = Harness::new(Duration::from_secs(60));
        let root = harness.files.root().to_path_buf();

        let stray = root.join("0000000000000033.bin");
        let clean = root.join("0000000000000034");
        let pending = root.join("0000000000000035.txt");
        for path in [&stray, &clean, &pending] {
            fs::write(path, b"x").unwrap();
        }

        let database = harness.inodes.database();
        for (id, bind) in [(0x34u64, None), (0x35, Some("pending".to_string()))] {
            database
                .put_inode(InodeRecord {
                    id: InodeID::new(id),
                    handle: Some(crate::remote::NodeHandle(900 + id)),
                    modified: 0,
                    name: "f".into(),
                    parent_handle: Some(ROOT_HANDLE),
                    bind_handle: bind,
                    extension: if id == 0x35 { ".txt".into() } else { String::new() },
                })
                .unwrap();
        }

        assert_eq!(harness.files.current().unwrap(), 2);
        assert!(!stray.exists());
        assert!(!clean.exists());
        assert!(pending.exists());
        assert!(database.inode(InodeID::new(0x34)).is_none());
    }

    #[test]
    fn test_remove_deletes_after_release() {
        let harness = Harness::new(Duration::from_secs(60));
        let root = harness.root();
        let inode = root.make_file(&harness.inodes, "new.txt").unwrap();

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        context.write(0, b"data", false).unwrap();
        let path = context.file().path().to_path_buf();
        assert!(path.exists());

        root.unlink(&harness.inodes, "new.txt").unwrap();
        harness.files.remove(&inode);
        assert!(path.exists());

        drop(context);
        assert!(!path.exists());
        assert_eq!(harness.client.uploads(), 0);
    }
}
