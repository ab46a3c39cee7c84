//! Persistent Engine State
//!
//! Keeps the inode table, the inode id allocator and the mounts table in
//! a single versioned JSON document. Every change is written atomically
//! through a temp file, so a crash leaves either the old or the new
//! document on disk.
//!
//! A commit rewrites the whole document. Bulk updates go through
//! [`Database::batch`] so they cost one write instead of one per record.

mod migrate;
mod schema;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FsError;
use crate::inode::InodeID;
use crate::mount::MountDescriptor;

pub use migrate::{downgrade, upgrade, version, LATEST};
pub use schema::{from_unix, to_unix, Document, InodeIdState, InodeRecord, SCHEMA_VERSION};

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Database format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database version {found} is newer than supported version {supported}")]
    Version { found: u32, supported: u32 },

    #[error("Database corrupt: {0}")]
    Corrupt(String),
}

impl From<DbError> for FsError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Io(e) => FsError::from(e),
            other => FsError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    /// Open [`Database::batch`] calls
    depth: usize,
    /// A change was kept back from disk while a batch was open
    deferred: bool,
}

/// Closes one batch level, even if the batched work panics
struct BatchLevel<'a>(&'a Mutex<Batch>);

impl Drop for BatchLevel<'_> {
    fn drop(&mut self) {
        self.0.lock().depth -= 1;
    }
}

/// Versioned, atomically persisted engine state
pub struct Database {
    /// Backing file; `None` keeps everything in memory
    path: Option<PathBuf>,
    document: Mutex<Document>,
    batch: Mutex<Batch>,
}

impl Database {
    /// Open the database at `path`, creating or migrating it as needed
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let document = if path.exists() {
            let text = fs::read_to_string(path)?;
            let mut raw: Value = serde_json::from_str(&text)?;
            let found = version(&raw);
            upgrade(&mut raw, SCHEMA_VERSION)?;
            let document: Document = serde_json::from_value(raw)?;

            info!(
                path = %path.display(),
                version = found,
                inodes = document.inodes.len(),
                mounts = document.mounts.len(),
                "Database loaded"
            );
            document
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            info!(path = %path.display(), "Creating database");
            Document::default()
        };

        let database = Self {
            path: Some(path.to_path_buf()),
            document: Mutex::new(document),
            batch: Mutex::new(Batch::default()),
        };
        database.commit(&database.document.lock())?;
        Ok(database)
    }

    /// Database that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(Document::default()),
            batch: Mutex::new(Batch::default()),
        }
    }

    /// Run `f` with commits held back, then write the document once
    ///
    /// Changes made meanwhile by other threads are held back too. Batches
    /// nest; only the outermost one writes.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> Result<T, DbError> {
        self.batch.lock().depth += 1;
        let result = {
            let _level = BatchLevel(&self.batch);
            f()
        };

        let document = self.document.lock();
        let commit = {
            let mut batch = self.batch.lock();
            batch.depth == 0 && std::mem::take(&mut batch.deferred)
        };
        if commit {
            if let Err(e) = self.commit(&document) {
                warn!(error = %e, "Failed to commit batched changes");
                self.batch.lock().deferred = true;
                return Err(e);
            }
        }
        Ok(result)
    }

    /// Whether a commit must wait for an open batch; marks it deferred if so
    fn defer(&self) -> bool {
        let mut batch = self.batch.lock();
        if batch.depth > 0 {
            batch.deferred = true;
        }
        batch.depth > 0
    }

    /// Apply `f` to the document and persist the result
    ///
    /// The in-memory document is rolled back if writing fails.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Document) -> T,
    {
        let mut document = self.document.lock();
        let before = document.clone();
        let result = f(&mut document);

        if *document != before && !self.defer() {
            let deferred = std::mem::take(&mut self.batch.lock().deferred);
            if let Err(e) = self.commit(&document) {
                *document = before;
                self.batch.lock().deferred = deferred;
                return Err(e);
            }
        }
        Ok(result)
    }

    fn commit(&self, document: &Document) -> Result<(), DbError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, document)?;
        temp.flush()?;
        temp.persist(path).map_err(|e| DbError::Io(e.error))?;

        debug!(path = %path.display(), "Database committed");
        Ok(())
    }

    /// Snapshot of the whole document
    pub fn document(&self) -> Document {
        self.document.lock().clone()
    }

    pub fn inodes(&self) -> Vec<InodeRecord> {
        self.document.lock().inodes.clone()
    }

    pub fn inode(&self, id: InodeID) -> Option<InodeRecord> {
        self.document
            .lock()
            .inodes
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Insert or replace the record for `record.id`
    pub fn put_inode(&self, record: InodeRecord) -> Result<(), DbError> {
        self.transaction(|document| {
            if record.id.get() >= document.inode_id.next {
                document.inode_id.next = record.id.get() + 1;
            }
            match document.inodes.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => document.inodes.push(record),
            }
        })
    }

    /// Remove the record for `id`
    ///
    /// # Returns
    /// true if a record existed
    pub fn remove_inode(&self, id: InodeID) -> Result<bool, DbError> {
        self.transaction(|document| {
            let before = document.inodes.len();
            document.inodes.retain(|record| record.id != id);
            document.inodes.len() != before
        })
    }

    pub fn next_inode_id(&self) -> u64 {
        self.document.lock().inode_id.next
    }

    /// Persist the allocator; it never moves backwards
    pub fn set_next_inode_id(&self, next: u64) -> Result<(), DbError> {
        self.transaction(|document| {
            document.inode_id.next = document.inode_id.next.max(next);
        })
    }

    pub fn mounts(&self) -> Vec<MountDescriptor> {
        self.document.lock().mounts.clone()
    }

    pub fn mount(&self, name: &str) -> Option<MountDescriptor> {
        self.document
            .lock()
            .mounts
            .iter()
            .find(|mount| mount.name == name)
            .cloned()
    }

    /// Insert or replace the descriptor stored under `name`
    pub fn put_mount(&self, name: &str, descriptor: MountDescriptor) -> Result<(), DbError> {
        self.transaction(|document| {
            match document.mounts.iter_mut().find(|mount| mount.name == name) {
                Some(existing) => *existing = descriptor,
                None => document.mounts.push(descriptor),
            }
        })
    }

    pub fn remove_mount(&self, name: &str) -> Result<bool, DbError> {
        self.transaction(|document| {
            let before = document.mounts.len();
            document.mounts.retain(|mount| mount.name != name);
            document.mounts.len() != before
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountFlags;
    use crate::remote::NodeHandle;

    fn record(id: u64, name: &str) -> InodeRecord {
        InodeRecord {
            id: InodeID::new(id),
            handle: None,
            modified: 1_700_000_000,
            name: name.to_string(),
            parent_handle: Some(NodeHandle(1)),
            bind_handle: Some("pending".into()),
            extension: ".txt".into(),
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let db = Database::open(&path).unwrap();
            db.put_inode(record(5, "a.txt")).unwrap();
            db.put_mount(
                "cloud",
                MountDescriptor {
                    name: "cloud".into(),
                    path: dir.path().join("mnt"),
                    handle: NodeHandle(1),
                    flags: MountFlags::default(),
                },
            )
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.inode(InodeID::new(5)).unwrap().name, "a.txt");
        assert_eq!(db.next_inode_id(), 6);
        assert_eq!(db.mounts().len(), 1);
        assert_eq!(db.document().version, SCHEMA_VERSION);
    }

    #[test]
    fn test_put_replaces_existing() {
        let db = Database::in_memory();
        db.put_inode(record(3, "a.txt")).unwrap();
        db.put_inode(record(3, "b.txt")).unwrap();

        assert_eq!(db.inodes().len(), 1);
        assert_eq!(db.inode(InodeID::new(3)).unwrap().name, "b.txt");
        assert!(db.remove_inode(InodeID::new(3)).unwrap());
        assert!(!db.remove_inode(InodeID::new(3)).unwrap());
    }

    #[test]
    fn test_opens_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{ "version": 1, "inode_id": { "next": 4 },
                 "inodes": [ { "id": 3, "handle": null, "modified": 0,
                               "name": "notes.md", "parent_handle": 1 } ],
                 "mounts": [] }"#,
        )
        .unwrap();

        let db = Database::open(&path).unwrap();
        let record = db.inode(InodeID::new(3)).unwrap();
        assert_eq!(record.extension, ".md");
        assert!(record.pending());

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(version(&raw), SCHEMA_VERSION);
    }

    #[test]
    fn test_batch_writes_once_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let db = Database::open(&path).unwrap();

        let on_disk = || -> usize {
            let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            raw["inodes"].as_array().map_or(0, Vec::len)
        };

        db.batch(|| {
            db.put_inode(record(5, "a.txt")).unwrap();
            db.batch(|| db.put_inode(record(6, "b.txt")).unwrap()).unwrap();
            assert_eq!(on_disk(), 0);
        })
        .unwrap();
        assert_eq!(on_disk(), 2);

        db.remove_inode(InodeID::new(5)).unwrap();
        assert_eq!(on_disk(), 1);
    }

    #[test]
    fn test_set_next_never_decreases() {
        let db = Database::in_memory();
        db.set_next_inode_id(10).unwrap();
        db.set_next_inode_id(4).unwrap();
        assert_eq!(db.next_inode_id(), 10);
    }
}
