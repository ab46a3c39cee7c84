//! Remote Storage Contract
//!
//! The engine talks to cloud storage only through [`RemoteClient`].
//! Operations are asynchronous; engine threads bridge onto the tokio
//! runtime with [`block_on`].

pub mod memory;
mod types;

use std::future::Future;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::runtime::Handle;

use crate::error::Result;

pub use memory::MemoryClient;
pub use types::{AccessLevel, NodeHandle, NodeInfo, Upload};

/// Stream of content chunks from a partial download
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Operations the engine needs from a remote content tree
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Describe a node
    async fn get(&self, handle: NodeHandle) -> Result<NodeInfo>;

    /// List the children of a directory
    async fn each(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>>;

    /// Create a directory under `parent`
    async fn make_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo>;

    /// Move a node under a new parent, giving it `name`
    async fn move_to(&self, handle: NodeHandle, parent: NodeHandle, name: &str) -> Result<()>;

    /// Rename a node in place
    async fn rename(&self, handle: NodeHandle, name: &str) -> Result<()>;

    /// Remove a node (and, for directories, everything below it)
    async fn remove(&self, handle: NodeHandle) -> Result<()>;

    /// Upload file content, optionally replacing an existing node
    ///
    /// # Returns
    /// The node now holding the content; its handle may differ from the replaced one
    async fn upload(&self, upload: Upload) -> Result<NodeInfo>;

    /// Download a whole file
    async fn download(&self, handle: NodeHandle) -> Result<Bytes>;

    /// Stream `length` bytes of a file starting at `offset`
    async fn partial_download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream>;

    /// Update a node's modification time
    async fn touch(&self, handle: NodeHandle, modified: SystemTime) -> Result<()>;
}

/// Run a remote operation to completion from a non-runtime thread
pub fn block_on<F: Future>(runtime: &Handle, future: F) -> F::Output {
    runtime.block_on(future)
}
