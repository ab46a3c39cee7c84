//! Shared test fixtures
//!
//! A [`Harness`] wires the engine against an in-memory remote, a temporary
//! cache directory and an in-memory database.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::cache::FileCache;
use crate::config::{ExecutorConfig, InodeCacheConfig, ServiceConfig};
use crate::db::Database;
use crate::inode::{InodeDB, InodeRef};
use crate::mount::{
    Invalidator, InvalidationHub, Mount, MountDescriptor, MountFlags, MountTable, NullPlatform,
    Platform, RecordingInvalidator,
};
use crate::remote::memory::{MemoryClient, ROOT_HANDLE};
use crate::remote::RemoteClient;
use crate::task::TaskExecutor;

pub struct Harness {
    pub client: Arc<MemoryClient>,
    pub database: Arc<Database>,
    pub inodes: Arc<InodeDB>,
    pub executor: Arc<TaskExecutor>,
    pub hub: Arc<InvalidationHub>,
    /// Everything the file cache and mounts announce
    pub invalidations: Arc<RecordingInvalidator>,
    pub files: Arc<FileCache>,
    pub platform: Arc<NullPlatform>,
    pub dir: TempDir,
    pub runtime: tokio::runtime::Runtime,
}

impl Harness {
    pub fn new(flush_delay: Duration) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            cache_dir: dir.path().join("cache"),
            flush_delay,
            executor: ExecutorConfig {
                idle_time: Duration::from_secs(5),
                max_workers: 4,
                min_workers: 1,
            },
            inode_cache: InodeCacheConfig {
                clean_age_threshold: Duration::ZERO,
                clean_interval: Duration::ZERO,
                clean_size_threshold: 1024,
            },
            ..ServiceConfig::default()
        };

        let client = Arc::new(MemoryClient::new());
        let remote = Arc::clone(&client) as Arc<dyn RemoteClient>;
        let database = Arc::new(Database::in_memory());
        let inodes = Arc::new(InodeDB::new(
            Arc::clone(&remote),
            runtime.handle().clone(),
            Arc::clone(&database),
            config.inode_cache,
        ));
        let executor = Arc::new(TaskExecutor::new(config.executor));

        let hub = Arc::new(InvalidationHub::new());
        let invalidations = Arc::new(RecordingInvalidator::new());
        hub.register(Arc::clone(&invalidations) as Arc<dyn Invalidator>);

        let files = FileCache::new(
            remote,
            runtime.handle().clone(),
            Arc::clone(&executor),
            Arc::clone(&inodes),
            Arc::clone(&hub) as Arc<dyn Invalidator>,
            &config,
        )
        .unwrap();

        Self {
            client,
            database,
            inodes,
            executor,
            hub,
            invalidations,
            files,
            platform: Arc::new(NullPlatform::new()),
            dir,
            runtime,
        }
    }

    pub fn root(&self) -> InodeRef {
        self.inodes.get(self.inodes.id_for_handle(ROOT_HANDLE)).unwrap()
    }

    pub fn child(&self, name: &str) -> InodeRef {
        self.root().child(&self.inodes, name).unwrap()
    }

    /// A mount of the remote root that is not registered with any table
    pub fn mount(&self, flags: MountFlags) -> Arc<Mount> {
        let descriptor =
            MountDescriptor::new("test", self.dir.path().join("mnt"), ROOT_HANDLE).with_flags(flags);
        Arc::new(Mount::new(
            descriptor,
            self.root(),
            Arc::clone(&self.inodes),
            Arc::clone(&self.files),
            Arc::clone(&self.hub) as Arc<dyn Invalidator>,
        ))
    }

    pub fn table(&self) -> MountTable {
        MountTable::new(
            Arc::clone(&self.database),
            Arc::clone(&self.inodes),
            Arc::clone(&self.files),
            Arc::clone(&self.hub),
            Arc::clone(&self.platform) as Arc<dyn Platform>,
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
