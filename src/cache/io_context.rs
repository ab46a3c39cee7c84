//! Per-file I/O coordination
//!
//! A [`FileIOContext`] serializes access to one file's local content and
//! drives its write-back to the remote. Reads of content that is not yet
//! resident go through a [`PartialDownloadManager`]; the first write makes
//! the whole file resident, after which the backing file is authoritative
//! until the next successful flush.
//!
//! Flushes are debounced: the first change schedules an upload after the
//! configured delay and later changes ride along with it.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{BackingFile, FileCache, FileInfo};
use crate::download::{PartialDownloadManager, RangeSink};
use crate::error::{FsError, Result};
use crate::inode::{InodeID, InodeRef};
use crate::lock::SharedMutex;
use crate::range::FileRange;
use crate::remote::Upload;
use crate::task::Task;

/// A manual flush gives up after this many cancelled attempts
const MANUAL_FLUSH_ATTEMPTS: usize = 5;

/// How long to wait for downloads still writing into a discarded file
const DOWNLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

enum Content {
    /// Not opened yet
    Absent,
    /// Remote content, fetched on demand
    Partial(Arc<PartialDownloadManager>),
    /// The backing file holds everything
    Complete,
}

struct ContextState {
    file: Option<Arc<BackingFile>>,
    content: Content,
    flush_needed: bool,
    /// Bumped on every change, so an upload only marks clean what it sent
    generation: u64,
    flush_task: Option<Task>,
    flush: Option<Arc<FlushContext>>,
}

/// One upload in flight, shared by every caller that wants it
struct FlushContext {
    token: CancellationToken,
    result: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl FlushContext {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn finish(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Coordinator of one file's local content and its upload
pub struct FileIOContext {
    inode: InodeRef,
    info: Arc<FileInfo>,
    cache: Arc<FileCache>,
    lock: SharedMutex,
    state: Mutex<ContextState>,
}

impl FileIOContext {
    pub(crate) fn new(inode: InodeRef, info: Arc<FileInfo>, cache: Arc<FileCache>) -> Self {
        Self {
            inode,
            info,
            cache,
            lock: SharedMutex::new(),
            state: Mutex::new(ContextState {
                file: None,
                content: Content::Absent,
                flush_needed: false,
                generation: 0,
                flush_task: None,
                flush: None,
            }),
        }
    }

    pub fn id(&self) -> InodeID {
        self.inode.id()
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    /// Local content record
    pub fn file(&self) -> &Arc<FileInfo> {
        &self.info
    }

    pub fn size(&self) -> u64 {
        self.info.size()
    }

    /// Whether local changes wait for upload
    pub fn flush_needed(&self) -> bool {
        self.state.lock().flush_needed
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state.lock().content, Content::Absent)
    }

    /// Whether the backing file holds the whole file
    pub fn is_complete(&self) -> bool {
        match &self.state.lock().content {
            Content::Absent => false,
            Content::Partial(manager) => manager.is_complete(),
            Content::Complete => true,
        }
    }

    /// Prepare the content for access
    ///
    /// # Arguments
    /// * `truncate` - Discard the content, as `O_TRUNC` does
    pub fn open(self: &Arc<Self>, truncate: bool) -> Result<()> {
        {
            let _guard = self.lock.lock();
            if !self.is_open() {
                self.load()?;
            }
        }

        if truncate {
            self.truncate(0, false)?;
        }
        Ok(())
    }

    /// Decide where content comes from; the exclusive lock must be held
    fn load(&self) -> Result<()> {
        let file = Arc::new(BackingFile::open(self.info.path())?);
        let handle = self.inode.handle();

        let content = if self.inode.local_modified() || handle.is_none() {
            // The local copy is the only current one.
            self.info.set_size(file.len()?);
            Content::Complete
        } else if self.info.complete_for(handle) {
            Content::Complete
        } else {
            let (size, modified) = {
                let state = self.inode.state();
                (state.size, state.modified)
            };

            file.set_len(0)?;
            self.info.update(size, modified);
            self.info.set_source(handle, size == 0);

            match handle {
                Some(handle) if size > 0 => {
                    Content::Partial(Arc::new(PartialDownloadManager::new(
                        Arc::clone(self.cache.client()),
                        self.cache.runtime().clone(),
                        handle,
                        size,
                        Arc::clone(&file) as Arc<dyn RangeSink>,
                        self.cache.download_config(),
                    )))
                }
                _ => Content::Complete,
            }
        };

        debug!(
            id = %self.id(),
            size = self.info.size(),
            partial = matches!(content, Content::Partial(_)),
            "Opened file content"
        );

        let mut state = self.state.lock();
        state.file = Some(file);
        state.content = content;
        Ok(())
    }

    fn opened(&self) -> Result<(Arc<BackingFile>, Option<Arc<PartialDownloadManager>>)> {
        let state = self.state.lock();
        let file = state
            .file
            .clone()
            .ok_or_else(|| FsError::InvalidArgument(format!("{} is not open", self.id())))?;
        let manager = match &state.content {
            Content::Partial(manager) => Some(Arc::clone(manager)),
            _ => None,
        };
        Ok((file, manager))
    }

    /// Fetch whatever is missing; the exclusive lock must be held
    fn make_complete(&self) -> Result<Arc<BackingFile>> {
        let (file, manager) = self.opened()?;

        if let Some(manager) = manager {
            manager.fetch_all()?;
            self.info.set_complete(true);
            self.state.lock().content = Content::Complete;
            debug!(id = %self.id(), "File content complete");
        }
        Ok(file)
    }

    /// Stop downloading and treat the backing file as complete
    fn discard_download(&self) -> Result<Arc<BackingFile>> {
        let (file, manager) = self.opened()?;

        if let Some(manager) = manager {
            manager.cancel();
            if !manager.wait_idle(DOWNLOAD_DRAIN_TIMEOUT) {
                return Err(FsError::Internal(format!(
                    "downloads of {} did not stop",
                    self.id()
                )));
            }
            self.state.lock().content = Content::Complete;
        }
        Ok(file)
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// Short only at end of file.
    pub fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        let _guard = self.lock.lock_shared();
        let (file, manager) = self.opened()?;
        self.inode.touch_accessed();

        let end = offset.saturating_add(size).min(self.info.size());
        if offset >= end {
            return Ok(Bytes::new());
        }

        let Some(manager) = manager else {
            return Ok(file.read(offset, end - offset)?);
        };

        let mut data = Vec::with_capacity((end - offset) as usize);
        let mut position = offset;
        while position < end {
            let chunk = manager.read(FileRange::new(position, end))?;
            if chunk.is_empty() {
                break;
            }
            position += chunk.len() as u64;
            data.extend_from_slice(&chunk);
        }

        trace!(id = %self.id(), offset = offset, length = data.len(), "Read");
        Ok(Bytes::from(data))
    }

    /// Write `data` at `offset`
    ///
    /// # Arguments
    /// * `no_grow` - Drop whatever would land past the current end of file
    ///
    /// # Returns
    /// Number of bytes written
    pub fn write(self: &Arc<Self>, offset: u64, data: &[u8], no_grow: bool) -> Result<usize> {
        self.cancel(false);

        let written = {
            let _guard = self.lock.lock();
            let file = self.make_complete()?;
            let size = self.info.size();

            let data = if no_grow {
                let room = size.saturating_sub(offset).min(data.len() as u64);
                &data[..room as usize]
            } else {
                data
            };
            if data.is_empty() {
                return Ok(0);
            }

            file.write(offset, data)?;
            self.info.update(size.max(offset + data.len() as u64), SystemTime::now());
            self.dirty()?;
            data.len()
        };

        self.modified();

        let invalidator = self.cache.invalidator();
        invalidator.data(self.id(), offset, written as u64);
        invalidator.attributes(self.id());
        Ok(written)
    }

    /// Change the size of the file
    ///
    /// Truncating to zero never downloads anything.
    ///
    /// # Arguments
    /// * `dont_grow` - Leave the file alone if `size` is past its end
    pub fn truncate(self: &Arc<Self>, size: u64, dont_grow: bool) -> Result<()> {
        self.cancel(false);

        let previous = {
            let _guard = self.lock.lock();
            let previous = self.info.size();
            if size == previous || (dont_grow && size > previous) {
                return Ok(());
            }

            let file = if size == 0 {
                self.discard_download()?
            } else {
                self.make_complete()?
            };

            file.set_len(size)?;
            self.info.update(size, SystemTime::now());
            self.dirty()?;
            previous
        };

        self.modified();

        let invalidator = self.cache.invalidator();
        if size < previous {
            invalidator.data(self.id(), size, 0);
        }
        invalidator.attributes(self.id());
        Ok(())
    }

    /// Set the modification time
    pub fn touch(self: &Arc<Self>, modified: SystemTime) -> Result<()> {
        self.cancel(false);

        {
            let _guard = self.lock.lock();
            self.opened()?;
            self.info.set_modified(modified);
            self.dirty()?;
        }

        self.modified();
        self.cache.invalidator().attributes(self.id());
        Ok(())
    }

    /// Mark the content changed; the exclusive lock must be held
    fn dirty(&self) -> Result<()> {
        let first = {
            let mut state = self.state.lock();
            state.generation += 1;
            !std::mem::replace(&mut state.flush_needed, true)
        };

        self.inode.set_local_modified(true);
        if first {
            let inodes = self.cache.inodes();
            inodes.pin(&self.inode);
            inodes.record(&self.inode, true)?;
        }
        Ok(())
    }

    /// Schedule a flush unless one is already pending
    ///
    /// The deadline is fixed by the first change after a flush.
    pub fn modified(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.flush_task.as_ref().map_or(false, |task| !task.completed()) {
            return;
        }

        let context = Arc::clone(self);
        let task = self.cache.executor().execute_after(
            move |task| context.periodic_flush(task),
            self.cache.flush_delay(),
            true,
        );

        trace!(id = %self.id(), delay_ms = self.cache.flush_delay().as_millis() as u64, "Flush scheduled");
        state.flush_task = Some(task);
    }

    fn periodic_flush(self: &Arc<Self>, task: &Task) {
        if task.cancelled() {
            return;
        }

        if let Err(e) = self.flush() {
            if self.inode.removed() || !self.flush_needed() {
                return;
            }
            warn!(id = %self.id(), error = %e, "Flush failed, rescheduling");
            self.modified();
        }
    }

    /// Upload now, replacing any scheduled flush
    pub fn manual_flush(self: &Arc<Self>) -> Result<()> {
        let scheduled = self.state.lock().flush_task.take();
        if let Some(task) = scheduled {
            task.cancel();
        }

        let mut result = Err(FsError::Cancelled);
        for attempt in 1..=MANUAL_FLUSH_ATTEMPTS {
            result = self.flush();
            match &result {
                Err(FsError::Cancelled) => {
                    debug!(id = %self.id(), attempt = attempt, "Manual flush cancelled, retrying");
                }
                _ => break,
            }
        }

        if result.is_err() && self.flush_needed() && !self.inode.removed() {
            self.modified();
        }
        result
    }

    /// Abort the upload in flight and, if `pending_flush`, the scheduled one
    pub fn cancel(&self, pending_flush: bool) {
        let (flush, task) = {
            let mut state = self.state.lock();
            let task = if pending_flush {
                state.flush_task.take()
            } else {
                None
            };
            (state.flush.clone(), task)
        };

        if let Some(flush) = flush {
            trace!(id = %self.id(), "Cancelling upload");
            flush.token.cancel();
        }
        if let Some(task) = task {
            task.cancel();
        }
    }

    /// Upload, or join the upload already in flight
    pub fn flush(&self) -> Result<()> {
        let (flush, leader) = {
            let mut state = self.state.lock();
            match &state.flush {
                Some(flush) => (Arc::clone(flush), false),
                None => {
                    let flush = Arc::new(FlushContext::new());
                    state.flush = Some(Arc::clone(&flush));
                    (flush, true)
                }
            }
        };

        if !leader {
            return flush.wait();
        }

        let result = self.upload(&flush.token);
        self.state.lock().flush = None;
        flush.finish(result.clone());
        result
    }

    fn upload(&self, token: &CancellationToken) -> Result<()> {
        if !self.flush_needed() {
            return Ok(());
        }
        if self.inode.removed() {
            self.state.lock().flush_needed = false;
            return Ok(());
        }

        // Fetch what is missing first, so readers keep going meanwhile.
        if let (_, Some(manager)) = self.opened()? {
            manager.fetch_all()?;
        }

        let (content, generation) = {
            let guard = self.lock.lock();
            let file = self.make_complete()?;

            let _shared = guard.downgrade();
            let generation = self.state.lock().generation;
            (file.snapshot(self.info.size())?, generation)
        };

        let inodes = self.cache.inodes();
        let attributes = self.inode.info();
        let parent = inodes
            .parent_handle(&self.inode)
            .ok_or_else(|| FsError::NotFound(format!("parent of {}", attributes.name)))?;

        let size = content.len();
        let upload = Upload {
            parent,
            name: attributes.name.clone(),
            content,
            modified: self.info.modified(),
            replace: attributes.handle,
        };

        debug!(id = %self.id(), name = %attributes.name, size = size, "Uploading file");
        let client = self.cache.client();
        let node = inodes.block_on(async {
            tokio::select! {
                _ = token.cancelled() => Err(FsError::Cancelled),
                result = client.upload(upload) => result,
            }
        })?;

        {
            let _guard = self.lock.lock();
            inodes.bind(&self.inode, node.handle);
            self.info.set_source(Some(node.handle), true);

            let clean = {
                let mut state = self.state.lock();
                if state.generation == generation {
                    state.flush_needed = false;
                }
                !state.flush_needed
            };

            if clean {
                self.inode.set_local_modified(false);
                self.inode.refresh(&node, None);
                inodes.record(&self.inode, false)?;
                inodes.unpin(self.id());
            }
        }

        if self.inode.removed() {
            // Removed while uploading; take the new node back out.
            if let Err(e) = inodes.block_on(client.remove(node.handle)) {
                warn!(id = %self.id(), error = %e, "Failed to remove upload of removed file");
            }
        }

        self.cache.invalidator().attributes(self.id());
        info!(id = %self.id(), handle = %node.handle, size = size, "Flushed file");
        Ok(())
    }

    /// Reload a file whose upload a previous run left pending
    pub(crate) fn restore(self: &Arc<Self>) -> Result<()> {
        self.open(false)?;
        {
            let mut state = self.state.lock();
            state.flush_needed = true;
            state.generation += 1;
        }
        self.modified();
        Ok(())
    }
}

impl Drop for FileIOContext {
    fn drop(&mut self) {
        let content = std::mem::replace(&mut self.state.get_mut().content, Content::Absent);
        if let Content::Partial(manager) = content {
            if manager.is_complete() {
                self.info.set_complete(true);
            } else {
                manager.cancel();
            }
        }

        self.cache
            .release(self.inode.id(), self.inode.removed(), self.info.path());
    }
}

impl std::fmt::Debug for FileIOContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIOContext")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("flush_needed", &self.flush_needed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    use crate::mount::Invalidation;
    use crate::remote::memory::ROOT_HANDLE;
    use crate::testing::{wait_until, Harness};

    const MIB: usize = 1 << 20;

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_debounced_writes_upload_once() {
        let harness = Harness::new(Duration::from_millis(300));
        harness.client.add_file(ROOT_HANDLE, "log", Bytes::new());
        let inode = harness.child("log");

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        context.write(0, b"abcd", false).unwrap();
        thread::sleep(Duration::from_millis(100));
        context.write(4, b"efgh", false).unwrap();
        assert_eq!(harness.client.uploads(), 0);

        assert!(wait_until(Duration::from_secs(5), || harness.client.uploads() == 1));
        thread::sleep(Duration::from_millis(500));
        assert_eq!(harness.client.uploads(), 1);

        let node = harness.client.find(ROOT_HANDLE, "log").unwrap();
        assert_eq!(&harness.client.content(node.handle).unwrap()[..], b"abcdefgh");
        assert!(!context.flush_needed());
        assert_eq!(inode.handle(), Some(node.handle));
    }

    #[test]
    fn test_deadline_is_not_extended_by_later_writes() {
        let harness = Harness::new(Duration::from_millis(300));
        harness.client.add_file(ROOT_HANDLE, "busy", Bytes::new());
        let context = harness.files.context(&harness.child("busy"));
        context.open(false).unwrap();

        let started = Instant::now();
        let mut offset = 0;
        while harness.client.uploads() == 0 && started.elapsed() < Duration::from_secs(5) {
            context.write(offset, b"x", false).unwrap();
            offset += 1;
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(harness.client.uploads(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_partial_reads_then_write_fetches_the_rest() {
        let harness = Harness::new(Duration::from_secs(60));
        let content = pattern(MIB);
        harness.client.add_file(ROOT_HANDLE, "big.bin", content.clone());
        let inode = harness.child("big.bin");

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        assert!(!context.is_complete());

        let head = context.read(0, 4096).unwrap();
        assert_eq!(&head[..], &content[..4096]);

        context.write(10, b"patched", false).unwrap();
        assert!(context.is_complete());
        assert_eq!(context.size(), MIB as u64);

        let tail = context.read(MIB as u64 - 16, 64).unwrap();
        assert_eq!(&tail[..], &content[MIB - 16..]);
        assert_eq!(&context.read(10, 7).unwrap()[..], b"patched");
    }

    #[test]
    fn test_truncate_to_zero_skips_download() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "big.bin", pattern(MIB));
        let inode = harness.child("big.bin");

        let context = harness.files.context(&inode);
        context.open(true).unwrap();

        assert_eq!(context.size(), 0);
        assert_eq!(harness.client.partial_downloads(), 0);
        assert!(context.flush_needed());
        assert_eq!(inode.info().size, 0);
    }

    #[test]
    fn test_truncate_invalidates_data_only_when_shrinking() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "f", &b"0123456789"[..]);
        let inode = harness.child("f");
        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        harness.invalidations.take();

        context.truncate(20, false).unwrap();
        assert_eq!(
            harness.invalidations.take(),
            vec![Invalidation::Attributes(inode.id())]
        );

        context.truncate(4, false).unwrap();
        assert_eq!(
            harness.invalidations.take(),
            vec![
                Invalidation::Data {
                    id: inode.id(),
                    offset: 4,
                    length: 0
                },
                Invalidation::Attributes(inode.id()),
            ]
        );

        context.truncate(8, true).unwrap();
        assert_eq!(context.size(), 4);
        assert_eq!(&context.read(0, 100).unwrap()[..], b"0123");
    }

    #[test]
    fn test_no_grow_write_stops_at_end() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "f", &b"abcdef"[..]);
        let context = harness.files.context(&harness.child("f"));
        context.open(false).unwrap();

        assert_eq!(context.write(4, b"XYZW", true).unwrap(), 2);
        assert_eq!(context.write(9, b"Q", true).unwrap(), 0);
        assert_eq!(&context.read(0, 100).unwrap()[..], b"abcdXY");
    }

    #[test]
    fn test_manual_flush_replaces_scheduled_flush() {
        let harness = Harness::new(Duration::from_secs(60));
        let root = harness.root();
        let inode = root.make_file(&harness.inodes, "notes.txt").unwrap();

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        context.write(0, b"hello", false).unwrap();
        assert_eq!(harness.executor.pending(), 1);

        context.manual_flush().unwrap();
        assert_eq!(harness.client.uploads(), 1);
        assert_eq!(Arc::strong_count(&context), 1);
        assert!(!harness.inodes.pinned(inode.id()));

        let node = harness.client.find(ROOT_HANDLE, "notes.txt").unwrap();
        assert_eq!(node.size, 5);
        let record = harness.inodes.persisted(inode.id()).unwrap();
        assert!(!record.pending());
        assert_eq!(record.handle, Some(node.handle));
    }

    #[test]
    fn test_failed_flush_keeps_changes_and_reschedules() {
        let harness = Harness::new(Duration::from_millis(100));
        let root = harness.root();
        let inode = root.make_file(&harness.inodes, "retry.txt").unwrap();
        harness.client.fail_uploads(1);

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        context.write(0, b"payload", false).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            harness.client.find(ROOT_HANDLE, "retry.txt").is_some()
        }));
        assert!(wait_until(Duration::from_secs(5), || !context.flush_needed()));
        assert_eq!(harness.client.uploads(), 1);
    }

    #[test]
    fn test_flush_after_touch_downloads_without_blocking_reads() {
        let harness = Harness::new(Duration::from_secs(60));
        let content = pattern(MIB);
        harness.client.add_file(ROOT_HANDLE, "big.bin", content.clone());
        harness.client.set_chunk_size(64 * 1024);
        harness.client.set_chunk_delay(Some(Duration::from_millis(20)));
        let inode = harness.child("big.bin");

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        context.touch(SystemTime::UNIX_EPOCH + Duration::from_secs(86_400)).unwrap();
        assert!(!context.is_complete());

        let flusher = {
            let context = Arc::clone(&context);
            thread::spawn(move || context.manual_flush())
        };
        thread::sleep(Duration::from_millis(50));

        let head = context.read(0, 4096).unwrap();
        assert_eq!(&head[..], &content[..4096]);
        assert!(!flusher.is_finished());

        flusher.join().unwrap().unwrap();
        assert!(context.is_complete());
        assert!(!context.flush_needed());
        let node = harness.client.find(ROOT_HANDLE, "big.bin").unwrap();
        assert_eq!(&harness.client.content(node.handle).unwrap()[..], &content[..]);
    }

    #[test]
    fn test_reopen_uses_resident_copy() {
        let harness = Harness::new(Duration::from_secs(60));
        harness.client.add_file(ROOT_HANDLE, "small", &b"resident"[..]);
        let inode = harness.child("small");

        {
            let context = harness.files.context(&inode);
            context.open(false).unwrap();
            assert_eq!(&context.read(0, 8).unwrap()[..], b"resident");
        }
        assert_eq!(harness.client.partial_downloads(), 1);

        let context = harness.files.context(&inode);
        context.open(false).unwrap();
        assert!(context.is_complete());
        assert_eq!(&context.read(0, 8).unwrap()[..], b"resident");
        assert_eq!(harness.client.partial_downloads(), 1);
    }
}
