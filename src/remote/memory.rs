//! In-memory remote
//!
//! A complete [`RemoteClient`] over a tree held in memory. Used as the test
//! backend and by the daemon's local demo mode, where it can be seeded from
//! a directory on disk. Fault injection hooks let tests exercise retries
//! and failed uploads.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use super::{AccessLevel, ByteStream, NodeHandle, NodeInfo, RemoteClient, Upload};
use crate::error::{FsError, Result};

/// Handle of the tree's root directory
pub const ROOT_HANDLE: NodeHandle = NodeHandle(1);

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum Content {
    Directory,
    File(Bytes),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeHandle>,
    name: String,
    content: Content,
    modified: SystemTime,
    permissions: AccessLevel,
}

impl Node {
    fn info(&self, handle: NodeHandle) -> NodeInfo {
        let (is_directory, size) = match &self.content {
            Content::Directory => (true, 0),
            Content::File(bytes) => (false, bytes.len() as u64),
        };

        NodeInfo {
            handle,
            parent: self.parent,
            name: self.name.clone(),
            is_directory,
            size,
            modified: self.modified,
            permissions: self.permissions,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<NodeHandle, Node>,
    next: u64,
}

impl Tree {
    fn node(&self, handle: NodeHandle) -> Result<&Node> {
        self.nodes
            .get(&handle)
            .ok_or_else(|| FsError::NotFound(format!("node {}", handle)))
    }

    fn directory(&self, handle: NodeHandle) -> Result<&Node> {
        let node = self.node(handle)?;
        match node.content {
            Content::Directory => Ok(node),
            Content::File(_) => Err(FsError::NotADirectory(node.name.clone())),
        }
    }

    fn child(&self, parent: NodeHandle, name: &str) -> Option<NodeHandle> {
        self.nodes
            .iter()
            .find(|(_, node)| node.parent == Some(parent) && node.name == name)
            .map(|(&handle, _)| handle)
    }

    fn insert(&mut self, node: Node) -> NodeHandle {
        self.next += 1;
        let handle = NodeHandle(self.next);
        self.nodes.insert(handle, node);
        handle
    }

    fn remove(&mut self, handle: NodeHandle) {
        let children: Vec<NodeHandle> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent == Some(handle))
            .map(|(&child, _)| child)
            .collect();

        for child in children {
            self.remove(child);
        }
        self.nodes.remove(&handle);
    }
}

#[derive(Debug)]
struct Faults {
    offline: bool,
    failed_uploads: u32,
    failed_downloads: u32,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

/// Remote content tree held in memory
#[derive(Debug)]
pub struct MemoryClient {
    tree: Mutex<Tree>,
    faults: Mutex<Faults>,
    uploads: AtomicUsize,
    partial_downloads: AtomicUsize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    /// Create a tree holding only the root directory
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_HANDLE,
            Node {
                parent: None,
                name: String::new(),
                content: Content::Directory,
                modified: SystemTime::now(),
                permissions: AccessLevel::Full,
            },
        );

        Self {
            tree: Mutex::new(Tree {
                nodes,
                next: ROOT_HANDLE.0,
            }),
            faults: Mutex::new(Faults {
                offline: false,
                failed_uploads: 0,
                failed_downloads: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
                chunk_delay: None,
            }),
            uploads: AtomicUsize::new(0),
            partial_downloads: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> NodeHandle {
        ROOT_HANDLE
    }

    /// Copy a local directory tree under `parent`
    pub fn seed_from(&self, parent: NodeHandle, dir: &Path) -> io::Result<usize> {
        let mut count = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let handle = self.add_directory(parent, &name);
                count += 1 + self.seed_from(handle, &entry.path())?;
            } else if file_type.is_file() {
                let content = fs::read(entry.path())?;
                self.add_file(parent, &name, content);
                count += 1;
            }
        }

        debug!(dir = %dir.display(), nodes = count, "Seeded memory remote");
        Ok(count)
    }

    /// Add a directory without going through the async interface
    pub fn add_directory(&self, parent: NodeHandle, name: &str) -> NodeHandle {
        self.tree.lock().insert(Node {
            parent: Some(parent),
            name: name.to_string(),
            content: Content::Directory,
            modified: SystemTime::now(),
            permissions: AccessLevel::Full,
        })
    }

    /// Add a file without going through the async interface
    pub fn add_file(&self, parent: NodeHandle, name: &str, content: impl Into<Bytes>) -> NodeHandle {
        self.tree.lock().insert(Node {
            parent: Some(parent),
            name: name.to_string(),
            content: Content::File(content.into()),
            modified: SystemTime::now(),
            permissions: AccessLevel::Full,
        })
    }

    /// Change a node's access level
    pub fn set_permissions(&self, handle: NodeHandle, permissions: AccessLevel) {
        if let Some(node) = self.tree.lock().nodes.get_mut(&handle) {
            node.permissions = permissions;
        }
    }

    /// Look up a child by name
    pub fn find(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo> {
        let tree = self.tree.lock();
        let handle = tree.child(parent, name)?;
        tree.nodes.get(&handle).map(|node| node.info(handle))
    }

    /// Content of a file node
    pub fn content(&self, handle: NodeHandle) -> Option<Bytes> {
        match &self.tree.lock().nodes.get(&handle)?.content {
            Content::File(bytes) => Some(bytes.clone()),
            Content::Directory => None,
        }
    }

    /// Remove a node behind the engine's back
    pub fn delete(&self, handle: NodeHandle) {
        self.tree.lock().remove(handle);
    }

    /// Make every operation fail with a network error
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Fail the next `count` uploads with a network error
    pub fn fail_uploads(&self, count: u32) {
        self.faults.lock().failed_uploads = count;
    }

    /// Fail the next `count` partial downloads with a network error
    pub fn fail_downloads(&self, count: u32) {
        self.faults.lock().failed_downloads = count;
    }

    /// Size of the chunks partial downloads are streamed in
    pub fn set_chunk_size(&self, size: usize) {
        self.faults.lock().chunk_size = size.max(1);
    }

    /// Delay before each streamed chunk
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.faults.lock().chunk_delay = delay;
    }

    /// Completed uploads so far
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Partial downloads started so far
    pub fn partial_downloads(&self) -> usize {
        self.partial_downloads.load(Ordering::SeqCst)
    }

    fn online(&self) -> Result<()> {
        if self.faults.lock().offline {
            return Err(FsError::Network("remote unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MemoryClient {
    async fn get(&self, handle: NodeHandle) -> Result<NodeInfo> {
        self.online()?;
        let tree = self.tree.lock();
        Ok(tree.node(handle)?.info(handle))
    }

    async fn each(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>> {
        self.online()?;
        let tree = self.tree.lock();
        tree.directory(parent)?;

        let mut children: Vec<NodeInfo> = tree
            .nodes
            .iter()
            .filter(|(_, node)| node.parent == Some(parent))
            .map(|(&handle, node)| node.info(handle))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn make_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo> {
        self.online()?;
        let mut tree = self.tree.lock();
        tree.directory(parent)?;

        if tree.child(parent, name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let node = Node {
            parent: Some(parent),
            name: name.to_string(),
            content: Content::Directory,
            modified: SystemTime::now(),
            permissions: AccessLevel::Full,
        };
        let info = node.info(NodeHandle(tree.next + 1));
        tree.insert(node);
        Ok(info)
    }

    async fn move_to(&self, handle: NodeHandle, parent: NodeHandle, name: &str) -> Result<()> {
        self.online()?;
        let mut tree = self.tree.lock();
        tree.directory(parent)?;

        if let Some(existing) = tree.child(parent, name) {
            if existing != handle {
                tree.remove(existing);
            }
        }

        let node = tree
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| FsError::NotFound(format!("node {}", handle)))?;
        node.parent = Some(parent);
        node.name = name.to_string();
        Ok(())
    }

    async fn rename(&self, handle: NodeHandle, name: &str) -> Result<()> {
        let parent = {
            let tree = self.tree.lock();
            tree.node(handle)?
                .parent
                .ok_or_else(|| FsError::InvalidArgument("cannot rename the root".into()))?
        };
        self.move_to(handle, parent, name).await
    }

    async fn remove(&self, handle: NodeHandle) -> Result<()> {
        self.online()?;
        let mut tree = self.tree.lock();
        tree.node(handle)?;
        tree.remove(handle);
        Ok(())
    }

    async fn upload(&self, upload: Upload) -> Result<NodeInfo> {
        self.online()?;
        {
            let mut faults = self.faults.lock();
            if faults.failed_uploads > 0 {
                faults.failed_uploads -= 1;
                return Err(FsError::Network("upload interrupted".into()));
            }
        }

        let mut tree = self.tree.lock();
        tree.directory(upload.parent)?;

        // Replacement yields a new handle, as cloud storage does.
        let mut permissions = AccessLevel::Full;
        let superseded = upload
            .replace
            .filter(|handle| tree.nodes.contains_key(handle))
            .or_else(|| tree.child(upload.parent, &upload.name));
        if let Some(old) = superseded {
            permissions = tree.node(old)?.permissions;
            tree.remove(old);
        }

        let node = Node {
            parent: Some(upload.parent),
            name: upload.name,
            content: Content::File(upload.content),
            modified: upload.modified,
            permissions,
        };
        let info = node.info(NodeHandle(tree.next + 1));
        tree.insert(node);

        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(info)
    }

    async fn download(&self, handle: NodeHandle) -> Result<Bytes> {
        self.online()?;
        let tree = self.tree.lock();
        match &tree.node(handle)?.content {
            Content::File(bytes) => Ok(bytes.clone()),
            Content::Directory => Err(FsError::IsADirectory(format!("node {}", handle))),
        }
    }

    async fn partial_download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream> {
        self.online()?;
        self.partial_downloads.fetch_add(1, Ordering::SeqCst);

        let content = self.download(handle).await?;
        let (chunk_size, delay, fail) = {
            let mut faults = self.faults.lock();
            let fail = faults.failed_downloads > 0;
            if fail {
                faults.failed_downloads -= 1;
            }
            (faults.chunk_size, faults.chunk_delay, fail)
        };

        let begin = (offset as usize).min(content.len());
        let end = (offset.saturating_add(length) as usize).min(content.len());

        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let mut cursor = begin;
        while cursor < end {
            let next = (cursor + chunk_size).min(end);
            chunks.push(Ok(content.slice(cursor..next)));
            cursor = next;
        }

        // An injected failure cuts the transfer after its first chunk.
        if fail {
            chunks.truncate(1);
            chunks.push(Err(FsError::Network("transfer interrupted".into())));
        }

        let stream = stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(stream.boxed())
    }

    async fn touch(&self, handle: NodeHandle, modified: SystemTime) -> Result<()> {
        self.online()?;
        let mut tree = self.tree.lock();
        let node = tree
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| FsError::NotFound(format!("node {}", handle)))?;
        node.modified = modified;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_upload_replaces_with_new_handle() {
        let client = MemoryClient::new();
        let old = client.add_file(ROOT_HANDLE, "a.txt", &b"old"[..]);

        let info = runtime()
            .block_on(client.upload(Upload {
                parent: ROOT_HANDLE,
                name: "a.txt".into(),
                content: Bytes::from_static(b"new content"),
                modified: SystemTime::now(),
                replace: Some(old),
            }))
            .unwrap();

        assert_ne!(info.handle, old);
        assert_eq!(info.size, 11);
        assert!(client.content(old).is_none());
        assert_eq!(client.find(ROOT_HANDLE, "a.txt").unwrap().handle, info.handle);
    }

    #[test]
    fn test_partial_download_chunks() {
        let client = MemoryClient::new();
        let file = client.add_file(ROOT_HANDLE, "f", vec![7u8; 100]);
        client.set_chunk_size(30);

        let chunks: Vec<Bytes> = runtime().block_on(async {
            let stream = client.partial_download(file, 10, 80).await.unwrap();
            stream.map(|chunk| chunk.unwrap()).collect().await
        });

        let lengths: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lengths, vec![30, 30, 20]);
    }

    #[test]
    fn test_remove_is_recursive() {
        let client = MemoryClient::new();
        let dir = client.add_directory(ROOT_HANDLE, "d");
        let file = client.add_file(dir, "f", &b"x"[..]);

        runtime().block_on(client.remove(dir)).unwrap();
        assert!(client.content(file).is_none());
    }

    #[test]
    fn test_offline_fails_with_network_error() {
        let client = MemoryClient::new();
        client.set_offline(true);

        let err = runtime().block_on(client.each(ROOT_HANDLE)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_seed_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"bbb").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let client = MemoryClient::new();
        assert_eq!(client.seed_from(ROOT_HANDLE, dir.path()).unwrap(), 3);

        let sub = client.find(ROOT_HANDLE, "sub").unwrap();
        assert!(sub.is_directory);
        assert_eq!(client.find(sub.handle, "b.txt").unwrap().size, 3);
    }
}
