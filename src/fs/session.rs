//! FUSE sessions
//!
//! [`FusePlatform`] mounts an enabled [`Mount`] with fuser's background
//! session. Kernel invalidations are sent from a dedicated thread: the kernel
//! may call back into the filesystem while a notification is in flight, so
//! they must never be issued from inside a request handler.

use std::ffi::OsStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fuser::{BackgroundSession, MountOption, Notifier};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::fuse::FuseFilesystem;
use super::inode::InoMap;
use crate::inode::InodeID;
use crate::mount::{Invalidation, Invalidator, Mount, MountError, Platform, Session};

/// Platform that presents mounts through FUSE
#[derive(Debug, Clone, Default)]
pub struct FusePlatform {
    allow_other: bool,
}

impl FusePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let other users access the mounts (needs `user_allow_other`)
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }

    fn options(&self, name: &str) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(format!("cloudmount-{}", name)),
            MountOption::NoAtime,     // Don't update access times (performance)
            MountOption::AutoUnmount, // Auto-unmount on process exit
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        options
    }
}

impl Platform for FusePlatform {
    fn mount(&self, mount: Arc<Mount>) -> Result<Session, MountError> {
        let name = mount.name();
        let path = mount.path();

        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| MountError::LocalPath {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }

        let inos = InoMap::new(mount.root_id());
        let filesystem = FuseFilesystem::new(Arc::clone(&mount));
        let session = fuser::spawn_mount2(filesystem, &path, &self.options(&name))
            .map_err(|e| MountError::Platform(format!("{}: {}", path.display(), e)))?;

        let invalidator = FuseInvalidator::start(&name, session.notifier(), inos)
            .map_err(|e| MountError::Platform(e.to_string()))?;
        let invalidator = Arc::new(invalidator);

        info!(mount = %name, path = %path.display(), "FUSE session started");
        let guard = FuseGuard {
            name,
            session: Some(session),
            invalidator: Arc::clone(&invalidator),
        };
        Ok(Session::new(invalidator as Arc<dyn Invalidator>, guard))
    }
}

/// Queues invalidations for the notifier thread
pub struct FuseInvalidator {
    sender: Mutex<Option<mpsc::UnboundedSender<Invalidation>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FuseInvalidator {
    fn start(name: &str, notifier: Notifier, inos: InoMap) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name(format!("fuse-notify-{}", name))
            .spawn(move || notify_loop(receiver, notifier, inos))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn send(&self, notice: Invalidation) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // The worker only goes away after close()
            let _ = sender.send(notice);
        }
    }

    /// Stop accepting notices and wait for the queue to drain
    fn close(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Invalidator for FuseInvalidator {
    fn attributes(&self, id: InodeID) {
        self.send(Invalidation::Attributes(id));
    }

    fn data(&self, id: InodeID, offset: u64, length: u64) {
        self.send(Invalidation::Data { id, offset, length });
    }

    fn entry(&self, parent: InodeID, name: &str) {
        self.send(Invalidation::Entry {
            parent,
            name: name.to_string(),
        });
    }
}

fn notify_loop(
    mut receiver: mpsc::UnboundedReceiver<Invalidation>,
    notifier: Notifier,
    inos: InoMap,
) {
    while let Some(notice) = receiver.blocking_recv() {
        // ENOENT just means the kernel holds nothing for the inode
        let result = match &notice {
            // A negative offset invalidates attributes only
            Invalidation::Attributes(id) => notifier.inval_inode(inos.to_ino(*id), -1, 0),
            Invalidation::Data { id, offset, length } => notifier.inval_inode(
                inos.to_ino(*id),
                *offset as i64,
                *length as i64,
            ),
            Invalidation::Entry { parent, name } => {
                notifier.inval_entry(inos.to_ino(*parent), OsStr::new(name))
            }
        };

        match result {
            Ok(()) => trace!(notice = ?notice, "Kernel cache invalidated"),
            Err(e) => trace!(notice = ?notice, error = %e, "Kernel invalidation skipped"),
        }
    }
}

/// Keeps a FUSE session mounted
struct FuseGuard {
    name: String,
    session: Option<BackgroundSession>,
    invalidator: Arc<FuseInvalidator>,
}

impl Drop for FuseGuard {
    fn drop(&mut self) {
        self.invalidator.close();
        // Dropping the session unmounts it
        drop(self.session.take());
        debug!(mount = %self.name, "FUSE session ended");
    }
}

