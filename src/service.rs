//! Engine service
//!
//! Builds every component by constructor injection and owns the startup and
//! shutdown order. Startup restores pending uploads before any mount is
//! enabled. Shutdown disables mounts first, so no new work arrives while the
//! remaining changes are flushed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::cache::FileCache;
use crate::config::ServiceConfig;
use crate::db::Database;
use crate::inode::InodeDB;
use crate::mount::{InvalidationHub, Invalidator, MountTable, Platform};
use crate::remote::RemoteClient;
use crate::task::TaskExecutor;

/// How long shutdown waits for open files to be released
const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled engine
pub struct Service {
    config: ServiceConfig,
    database: Arc<Database>,
    inodes: Arc<InodeDB>,
    executor: Arc<TaskExecutor>,
    hub: Arc<InvalidationHub>,
    files: Arc<FileCache>,
    mounts: MountTable,
}

impl Service {
    /// Open the cache, recover pending work and enable startup mounts
    ///
    /// # Arguments
    /// * `client` - Remote content tree
    /// * `runtime` - Runtime that drives remote futures; engine threads block on it
    /// * `platform` - Presents enabled mounts to the operating system
    pub fn new(
        config: ServiceConfig,
        client: Arc<dyn RemoteClient>,
        runtime: Handle,
        platform: Arc<dyn Platform>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", config.cache_dir))?;

        let database_path = config.database_path();
        let database = Arc::new(
            Database::open(&database_path)
                .with_context(|| format!("Failed to open database: {:?}", database_path))?,
        );

        let inodes = Arc::new(InodeDB::new(
            Arc::clone(&client),
            runtime.clone(),
            Arc::clone(&database),
            config.inode_cache,
        ));
        let executor = Arc::new(TaskExecutor::new(config.executor));
        let hub = Arc::new(InvalidationHub::new());
        let files = FileCache::new(
            client,
            runtime,
            Arc::clone(&executor),
            Arc::clone(&inodes),
            Arc::clone(&hub) as Arc<dyn Invalidator>,
            &config,
        )?;

        let kept = files
            .current()
            .context("Failed to scan cached files")?;
        let resumed = files.resume(inodes.current());

        let mounts = MountTable::new(
            Arc::clone(&database),
            Arc::clone(&inodes),
            Arc::clone(&files),
            Arc::clone(&hub),
            platform,
        );
        let enabled = mounts.enable_at_startup();

        info!(
            cache_dir = %config.cache_dir.display(),
            kept = kept,
            resumed = resumed,
            enabled = enabled,
            "Service started"
        );

        Ok(Self {
            config,
            database,
            inodes,
            executor,
            hub,
            files,
            mounts,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn inodes(&self) -> &Arc<InodeDB> {
        &self.inodes
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn hub(&self) -> &Arc<InvalidationHub> {
        &self.hub
    }

    pub fn files(&self) -> &Arc<FileCache> {
        &self.files
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Re-check remote state after the remote reports changes
    ///
    /// # Returns
    /// Number of inodes whose remote node vanished
    pub fn refresh(&self) -> usize {
        self.mounts.invalidate()
    }

    /// Flush everything and stop background work
    ///
    /// Changes that still fail to upload stay pending and are resumed by the
    /// next start.
    pub fn shutdown(&self) {
        info!("Service shutting down...");

        self.mounts.disable_all();
        let failed = self.files.flush_all();
        if failed > 0 {
            warn!(failed = failed, "Some files could not be uploaded before shutdown");
        }

        self.executor.shutdown();
        if !self.files.cancel_all(RELEASE_TIMEOUT) {
            warn!("Timed out waiting for open files to be released");
        }
        self.inodes.shutdown();

        info!("Service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, InodeCacheConfig};
    use crate::mount::{MountDescriptor, MountFlags, NullPlatform};
    use crate::remote::memory::{MemoryClient, ROOT_HANDLE};

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        client: Arc<MemoryClient>,
        platform: Arc<NullPlatform>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .unwrap(),
                client: Arc::new(MemoryClient::new()),
                platform: Arc::new(NullPlatform::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn start(&self) -> Service {
            let config = ServiceConfig {
                cache_dir: self.dir.path().join("cache"),
                flush_delay: Duration::from_secs(60),
                executor: ExecutorConfig {
                    min_workers: 1,
                    ..ExecutorConfig::default()
                },
                inode_cache: InodeCacheConfig {
                    clean_interval: Duration::ZERO,
                    ..InodeCacheConfig::default()
                },
                ..ServiceConfig::default()
            };
            Service::new(
                config,
                Arc::clone(&self.client) as Arc<dyn RemoteClient>,
                self.runtime.handle().clone(),
                Arc::clone(&self.platform) as Arc<dyn Platform>,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_persistent_mount_enabled_on_restart() {
        let fixture = Fixture::new();
        let service = fixture.start();
        let descriptor = MountDescriptor::new("cloud", fixture.dir.path().join("mnt"), ROOT_HANDLE)
            .with_flags(MountFlags {
                persistent: true,
                ..MountFlags::default()
            });
        service.mounts().add(descriptor).unwrap();
        service.mounts().enable("cloud", true).unwrap();
        service.shutdown();
        drop(service);
        assert!(fixture.platform.mounted().is_empty());

        let service = fixture.start();
        assert!(service.mounts().enabled("cloud"));
        assert_eq!(fixture.platform.mounted(), vec!["cloud".to_string()]);
        service.shutdown();
    }

    #[test]
    fn test_failed_upload_resumes_after_restart() {
        let fixture = Fixture::new();
        let service = fixture.start();
        let descriptor =
            MountDescriptor::new("cloud", fixture.dir.path().join("mnt"), ROOT_HANDLE);
        service.mounts().add(descriptor).unwrap();
        let mount = service.mounts().enable("cloud", false).unwrap();

        let info = mount.make_file(mount.root_id(), "notes.txt").unwrap();
        let file = mount.open(info.id, true, false).unwrap();
        mount.write(&file, 0, b"offline edit").unwrap();
        drop(file);
        drop(mount);

        fixture.client.fail_uploads(u32::MAX);
        service.shutdown();
        drop(service);
        assert!(fixture.client.find(ROOT_HANDLE, "notes.txt").is_none());

        fixture.client.fail_uploads(0);
        let service = fixture.start();
        assert_eq!(service.files().flush_all(), 0);

        let node = fixture.client.find(ROOT_HANDLE, "notes.txt").unwrap();
        assert_eq!(&fixture.client.content(node.handle).unwrap()[..], b"offline edit");
        service.shutdown();
    }
}
