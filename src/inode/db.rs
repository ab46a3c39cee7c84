//! Inode arena
//!
//! The single owner of inode identity. It maps remote handles to stable
//! local ids, hands out at most one live [`Inode`] per id, and
//! brings inodes back from the remote when every holder has dropped them.
//!
//! The arena keeps weak references only; inodes stay alive through their
//! holders, the [`InodeCache`], or a pin for files that exist only locally.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Inode, InodeCache, InodeID, InodeRef};
use crate::cache::extension;
use crate::config::InodeCacheConfig;
use crate::db::{from_unix, to_unix, Database, InodeRecord};
use crate::error::{FsError, Result};
use crate::remote::{NodeHandle, NodeInfo, RemoteClient};

/// Dead arena entries are swept after this many insertions
const PRUNE_INTERVAL: usize = 256;

/// Marker persisted while local content waits for upload
const PENDING_UPLOAD: &str = "pending";

struct State {
    arena: HashMap<InodeID, Weak<Inode>>,
    by_handle: HashMap<NodeHandle, InodeID>,
    handles: HashMap<InodeID, NodeHandle>,
    /// Inodes kept alive regardless of holders
    pinned: HashMap<InodeID, InodeRef>,
    next: InodeID,
    inserts: usize,
}

impl State {
    fn allocate(&mut self) -> InodeID {
        let id = self.next;
        self.next = id.next();
        id
    }

    fn live(&self, id: InodeID) -> Option<InodeRef> {
        self.arena.get(&id).and_then(Weak::upgrade)
    }

    fn insert(&mut self, inode: &InodeRef) {
        self.arena.insert(inode.id(), Arc::downgrade(inode));
        self.inserts += 1;

        if self.inserts >= PRUNE_INTERVAL {
            self.inserts = 0;
            self.arena.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    fn map(&mut self, id: InodeID, handle: NodeHandle) {
        if let Some(old) = self.handles.insert(id, handle) {
            if old != handle {
                self.by_handle.remove(&old);
            }
        }
        self.by_handle.insert(handle, id);
    }
}

/// Arena of live inodes and the id/handle mapping
pub struct InodeDB {
    client: Arc<dyn RemoteClient>,
    runtime: Handle,
    database: Arc<Database>,
    cache: InodeCache,
    state: Mutex<State>,
}

impl InodeDB {
    /// Create the arena, taking the id allocator and known handles from `database`
    pub fn new(
        client: Arc<dyn RemoteClient>,
        runtime: Handle,
        database: Arc<Database>,
        cache: InodeCacheConfig,
    ) -> Self {
        let mut state = State {
            arena: HashMap::new(),
            by_handle: HashMap::new(),
            handles: HashMap::new(),
            pinned: HashMap::new(),
            next: InodeID::new(database.next_inode_id()).max(InodeID::FIRST),
            inserts: 0,
        };

        for record in database.inodes() {
            if let Some(handle) = record.handle {
                state.map(record.id, handle);
            }
        }

        Self {
            client,
            runtime,
            database,
            cache: InodeCache::new(cache),
            state: Mutex::new(state),
        }
    }

    pub fn client(&self) -> &dyn RemoteClient {
        self.client.as_ref()
    }

    /// Run a remote operation from a non-runtime thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        crate::remote::block_on(&self.runtime, future)
    }

    pub fn cache(&self) -> &InodeCache {
        &self.cache
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Live inode for `id`, without contacting the remote
    pub fn lookup(&self, id: InodeID) -> Option<InodeRef> {
        self.state.lock().live(id)
    }

    /// Whether an inode for `id` is alive
    pub fn exists(&self, id: InodeID) -> bool {
        self.lookup(id).is_some()
    }

    /// Inode for `id`, fetching it from the remote if no instance is alive
    pub fn get(&self, id: InodeID) -> Result<InodeRef> {
        let handle = {
            let state = self.state.lock();
            if let Some(inode) = state.live(id) {
                return Ok(inode);
            }
            state.handles.get(&id).copied()
        };

        let handle = handle.ok_or_else(|| FsError::NotFound(format!("inode {}", id)))?;
        let node = self.block_on(self.client.get(handle))?;
        let parent = node.parent.map(|parent| self.id_for_handle(parent));
        Ok(self.materialize(node, parent))
    }

    /// Id for a remote handle, allocating one if the handle is new
    pub fn id_for_handle(&self, handle: NodeHandle) -> InodeID {
        let mut state = self.state.lock();
        if let Some(&id) = state.by_handle.get(&handle) {
            return id;
        }

        let id = state.allocate();
        state.map(id, handle);
        id
    }

    /// The one live inode describing `node`, refreshed with its attributes
    pub fn materialize(&self, node: NodeInfo, parent: Option<InodeID>) -> InodeRef {
        let inode = {
            let mut state = self.state.lock();
            let id = match state.by_handle.get(&node.handle) {
                Some(&id) => id,
                None => {
                    let id = state.allocate();
                    state.map(id, node.handle);
                    id
                }
            };

            match state.live(id) {
                Some(inode) => {
                    inode.refresh(&node, parent);
                    inode
                }
                None => {
                    let inode = Arc::new(Inode::from_node(id, &node, parent));
                    state.insert(&inode);
                    inode
                }
            }
        };

        self.cache.add(&inode);
        inode
    }

    /// Create a file under `parent` that has no remote node yet
    ///
    /// The inode is pinned until its content is uploaded.
    pub fn make_local_file(&self, parent: &Inode, name: &str) -> Result<InodeRef> {
        let (inode, next) = {
            let mut state = self.state.lock();
            let id = state.allocate();
            let inode = Arc::new(Inode::local_file(id, name, Some(parent.id())));
            state.insert(&inode);
            state.pinned.insert(id, Arc::clone(&inode));
            (inode, state.next)
        };

        self.database.set_next_inode_id(next.get())?;
        self.cache.add(&inode);
        Ok(inode)
    }

    /// Pinned, not yet uploaded files under `parent`
    pub fn local_children(&self, parent: InodeID) -> Vec<InodeRef> {
        self.state
            .lock()
            .pinned
            .values()
            .filter(|inode| inode.handle().is_none() && inode.parent() == Some(parent))
            .cloned()
            .collect()
    }

    /// Keep `inode` alive without any other holder
    pub fn pin(&self, inode: &InodeRef) {
        self.state.lock().pinned.insert(inode.id(), Arc::clone(inode));
    }

    pub fn unpin(&self, id: InodeID) -> Option<InodeRef> {
        self.state.lock().pinned.remove(&id)
    }

    pub fn pinned(&self, id: InodeID) -> bool {
        self.state.lock().pinned.contains_key(&id)
    }

    /// Associate `inode` with the remote node now holding its content
    pub fn bind(&self, inode: &InodeRef, handle: NodeHandle) {
        let mut state = self.state.lock();
        state.map(inode.id(), handle);
        inode.state().handle = Some(handle);
    }

    /// Mark `inode` removed and drop everything that keeps it findable
    pub fn removed(&self, inode: &InodeRef) {
        let pinned = {
            let mut state = self.state.lock();
            if let Some(handle) = state.handles.remove(&inode.id()) {
                state.by_handle.remove(&handle);
            }
            state.pinned.remove(&inode.id())
        };

        let (name, parent) = {
            let mut state = inode.state();
            state.removed = true;
            (state.name.clone(), state.parent)
        };
        if let Some(parent) = parent.and_then(|parent| self.lookup(parent)) {
            parent.remove_entry(&name, inode.id());
        }
        self.cache.remove(inode.id());
        if let Err(e) = self.database.remove_inode(inode.id()) {
            warn!(id = %inode.id(), error = %e, "Failed to forget removed inode");
        }

        // Released after the arena lock.
        drop(pinned);
    }

    /// Remote handle of the parent of `inode`
    pub fn parent_handle(&self, inode: &Inode) -> Option<NodeHandle> {
        let parent = inode.parent()?;
        let state = self.state.lock();
        state
            .live(parent)
            .and_then(|parent| parent.handle())
            .or_else(|| state.handles.get(&parent).copied())
    }

    /// Persist the local state of `inode`
    ///
    /// # Arguments
    /// * `pending` - Local content is waiting to be uploaded
    pub fn record(&self, inode: &Inode, pending: bool) -> Result<()> {
        let info = inode.info();
        let record = InodeRecord {
            id: info.id,
            handle: info.handle,
            modified: to_unix(info.modified),
            extension: extension(&info.name),
            name: info.name,
            parent_handle: self.parent_handle(inode),
            bind_handle: pending.then(|| PENDING_UPLOAD.to_string()),
        };

        self.database.put_inode(record)?;
        Ok(())
    }

    /// Persisted record of `id`
    pub fn persisted(&self, id: InodeID) -> Option<InodeRecord> {
        self.database.inode(id)
    }

    /// Drop the persisted record of `id`
    pub fn forget(&self, id: InodeID) -> Result<()> {
        self.database.remove_inode(id)?;
        Ok(())
    }

    /// Update the persisted record after a rename or move
    pub fn moved(&self, inode: &InodeRef) -> Result<()> {
        match self.database.inode(inode.id()) {
            Some(record) => self.record(inode, record.bind_handle.is_some()),
            None => Ok(()),
        }
    }

    /// Bring back inodes whose content was left unflushed by a previous run
    ///
    /// # Returns
    /// The restored inodes, pinned until they are flushed
    pub fn current(&self) -> Vec<InodeRef> {
        let mut restored = Vec::new();

        for record in self.database.inodes() {
            if !record.pending() {
                continue;
            }

            let parent = record.parent_handle.map(|handle| self.id_for_handle(handle));
            let inode = {
                let mut state = self.state.lock();
                if let Some(inode) = state.live(record.id) {
                    inode
                } else {
                    let inode = Arc::new(Inode::local_file(record.id, &record.name, parent));
                    {
                        let mut inode_state = inode.state();
                        inode_state.handle = record.handle;
                        inode_state.modified = from_unix(record.modified);
                    }
                    if let Some(handle) = record.handle {
                        state.map(record.id, handle);
                    }
                    state.insert(&inode);
                    if state.next <= record.id {
                        state.next = record.id.next();
                    }
                    inode
                }
            };

            self.pin(&inode);
            restored.push(inode);
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "Restored inodes with pending uploads");
        }
        restored
    }

    /// Re-check live inodes against the remote, marking vanished ones removed
    ///
    /// # Returns
    /// The inodes that were marked removed
    pub fn invalidate(&self) -> Vec<InodeRef> {
        let live: Vec<InodeRef> = {
            let state = self.state.lock();
            state.arena.values().filter_map(Weak::upgrade).collect()
        };

        let mut vanished = Vec::new();
        for inode in live {
            let Some(handle) = inode.handle() else {
                continue;
            };
            if inode.removed() {
                continue;
            }

            match self.block_on(self.client.get(handle)) {
                Ok(node) => {
                    inode.refresh(&node, None);
                    if inode.is_directory() {
                        inode.forget_entries();
                    }
                }
                Err(FsError::NotFound(_)) => {
                    debug!(id = %inode.id(), handle = %handle, "Remote node vanished");
                    vanished.push(inode);
                }
                Err(e) => {
                    warn!(id = %inode.id(), error = %e, "Failed to re-check inode");
                }
            }
        }

        let batched = self.database.batch(|| {
            for inode in &vanished {
                self.removed(inode);
            }
        });
        if let Err(e) = batched {
            warn!(error = %e, "Failed to persist removed inodes");
        }
        vanished
    }

    /// Persist the id allocator and release every cached reference
    pub fn shutdown(&self) {
        let (next, pinned) = {
            let mut state = self.state.lock();
            (state.next, std::mem::take(&mut state.pinned))
        };

        if let Err(e) = self.database.set_next_inode_id(next.get()) {
            warn!(error = %e, "Failed to persist inode allocator");
        }

        let cached = self.cache.clear();
        debug!(
            cached = cached.len(),
            pinned = pinned.len(),
            "Inode arena shut down"
        );
    }

    /// Time of the last remote modification, for freshness checks
    pub fn remote_modified(&self, inode: &Inode) -> Option<SystemTime> {
        let handle = inode.handle()?;
        self.block_on(self.client.get(handle)).ok().map(|node| node.modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{MemoryClient, ROOT_HANDLE};
    use std::time::Duration;

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        client: Arc<MemoryClient>,
        database: Arc<Database>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .unwrap(),
                client: Arc::new(MemoryClient::new()),
                database: Arc::new(Database::in_memory()),
            }
        }

        fn db(&self) -> InodeDB {
            InodeDB::new(
                Arc::clone(&self.client) as Arc<dyn RemoteClient>,
                self.runtime.handle().clone(),
                Arc::clone(&self.database),
                InodeCacheConfig {
                    clean_age_threshold: Duration::ZERO,
                    clean_interval: Duration::ZERO,
                    clean_size_threshold: 64,
                },
            )
        }

        fn root(&self, db: &InodeDB) -> InodeRef {
            db.get(db.id_for_handle(ROOT_HANDLE)).unwrap()
        }
    }

    #[test]
    fn test_one_instance_per_id() {
        let fixture = Fixture::new();
        fixture.client.add_file(ROOT_HANDLE, "a", &b"x"[..]);
        let db = fixture.db();
        let root = fixture.root(&db);

        let first = root.child(&db, "a").unwrap();
        let second = root.child(&db, "a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.id() >= InodeID::FIRST);
    }

    #[test]
    fn test_rehydrates_dropped_inode() {
        let fixture = Fixture::new();
        fixture.client.add_file(ROOT_HANDLE, "a", &b"hello"[..]);
        let db = fixture.db();
        let root = fixture.root(&db);

        let id = root.child(&db, "a").unwrap().id();
        db.cache().clear();
        assert!(!db.exists(id));

        let again = db.get(id).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.info().size, 5);
        assert_eq!(again.parent(), Some(root.id()));
    }

    #[test]
    fn test_rmdir_requires_empty_directory() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);

        let dir = root.make_directory(&db, "d").unwrap();
        dir.make_file(&db, "f").unwrap();

        let err = root.remove_directory(&db, "d").unwrap_err();
        assert!(matches!(err, FsError::NotEmpty(_)));

        dir.unlink(&db, "f").unwrap();
        root.remove_directory(&db, "d").unwrap();

        let info = dir.info();
        assert!(info.removed);
        assert_eq!(info.name, "d");
        assert!(fixture.client.find(ROOT_HANDLE, "d").is_none());
    }

    #[test]
    fn test_unlink_rejects_directories() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);
        root.make_directory(&db, "d").unwrap();

        assert!(matches!(root.unlink(&db, "d"), Err(FsError::IsADirectory(_))));
        assert!(matches!(
            root.remove_directory(&db, "missing"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_checks_happen_before_remote() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);
        fixture.client.set_offline(true);

        let long = "n".repeat(300);
        assert!(matches!(
            root.make_directory(&db, &long),
            Err(FsError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_move_replaces_and_guards_subtree() {
        let fixture = Fixture::new();
        fixture.client.add_file(ROOT_HANDLE, "a", &b"aaa"[..]);
        fixture.client.add_file(ROOT_HANDLE, "b", &b"bb"[..]);
        let db = fixture.db();
        let root = fixture.root(&db);

        let a = root.child(&db, "a").unwrap();
        let replaced = a.move_to(&db, &root, "b").unwrap().unwrap();
        assert!(replaced.removed());
        assert_eq!(a.name(), "b");
        assert_eq!(fixture.client.find(ROOT_HANDLE, "b").unwrap().size, 3);

        let outer = root.make_directory(&db, "outer").unwrap();
        let inner = outer.make_directory(&db, "inner").unwrap();
        assert!(matches!(
            outer.move_to(&db, &inner, "loop"),
            Err(FsError::InvalidArgument(_))
        ));

        assert!(matches!(
            a.move_to(&db, &root, "outer"),
            Err(FsError::IsADirectory(_))
        ));
        inner.make_file(&db, "keep").unwrap();
        let empty = root.make_directory(&db, "empty").unwrap();
        assert!(matches!(
            empty.move_to(&db, &outer, "inner"),
            Err(FsError::NotEmpty(_))
        ));
    }

    #[test]
    fn test_local_files_are_listed_and_pinned() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);

        let id = root.make_file(&db, "new.txt").unwrap().id();
        db.cache().clear();

        assert!(db.pinned(id));
        let names: Vec<String> = root.children(&db).unwrap().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["new.txt".to_string()]);
    }

    #[test]
    fn test_restores_pending_records() {
        let fixture = Fixture::new();
        fixture
            .database
            .put_inode(InodeRecord {
                id: InodeID::new(40),
                handle: None,
                modified: 0,
                name: "unsent.txt".into(),
                parent_handle: Some(ROOT_HANDLE),
                bind_handle: Some(PENDING_UPLOAD.into()),
                extension: ".txt".into(),
            })
            .unwrap();

        let db = fixture.db();
        let restored = db.current();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id(), InodeID::new(40));
        assert!(db.pinned(InodeID::new(40)));

        // Fresh ids never collide with restored ones.
        let root = fixture.root(&db);
        assert!(root.id() > InodeID::new(40));
    }

    #[test]
    fn test_shape_checks_answered_offline() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);
        let dir = root.make_directory(&db, "d").unwrap();
        dir.make_file(&db, "f").unwrap();
        root.make_file(&db, "plain").unwrap();

        fixture.client.set_offline(true);
        assert!(matches!(
            root.make_directory(&db, "d"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(root.make_file(&db, "plain"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(
            root.remove_directory(&db, "d"),
            Err(FsError::NotEmpty(_))
        ));
        assert!(matches!(root.unlink(&db, "missing"), Err(FsError::NotFound(_))));
        assert!(matches!(root.unlink(&db, "d"), Err(FsError::IsADirectory(_))));
    }

    #[test]
    fn test_invalidate_relists_directories() {
        let fixture = Fixture::new();
        let db = fixture.db();
        let root = fixture.root(&db);
        assert!(root.children(&db).unwrap().is_empty());

        fixture.client.add_file(ROOT_HANDLE, "later", &b"x"[..]);
        assert!(root.find_child(&db, "later").unwrap().is_none());

        db.invalidate();
        assert!(!root.listed());
        assert_eq!(root.child(&db, "later").unwrap().info().size, 1);
    }

    #[test]
    fn test_invalidate_marks_vanished_nodes() {
        let fixture = Fixture::new();
        let handle = fixture.client.add_file(ROOT_HANDLE, "gone", &b"x"[..]);
        let db = fixture.db();
        let root = fixture.root(&db);
        let gone = root.child(&db, "gone").unwrap();

        fixture.client.delete(handle);
        let vanished = db.invalidate();

        assert_eq!(vanished.len(), 1);
        assert!(gone.removed());
        assert!(!root.removed());
        assert!(root.children(&db).unwrap().is_empty());
    }
}
