//! Range-granular downloads of a single remote file
//!
//! A [`PartialDownloadManager`] tracks which bytes of one remote file are
//! resident locally and which are being fetched. Each fetch runs as a
//! [`PartialDownloadContext`] covering one target range. Reads that start
//! inside a fetch queue on it and are answered once their range, or at
//! least `min_chunk` bytes of it, has arrived.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::RangeSink;
use crate::config::DownloadConfig;
use crate::error::{FsError, Result};
use crate::range::{FileRange, FileRangeSet};
use crate::remote::{NodeHandle, RemoteClient};

struct Request {
    range: FileRange,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct ContextState {
    /// End of the data received so far
    end: u64,
    /// Data received since the start of the target range
    buffer: Vec<u8>,
    requests: Vec<Request>,
}

/// One in-flight fetch of a target range
pub struct PartialDownloadContext {
    range: FileRange,
    /// Retries left for retryable transfer failures
    retries: u32,
    token: CancellationToken,
    state: Mutex<ContextState>,
}

impl PartialDownloadContext {
    fn new(range: FileRange, retries: u32, token: CancellationToken) -> Self {
        Self {
            range,
            retries,
            token,
            state: Mutex::new(ContextState {
                end: range.begin,
                buffer: Vec::new(),
                requests: Vec::new(),
            }),
        }
    }

    /// Target range of the fetch
    pub fn range(&self) -> FileRange {
        self.range
    }

    /// Range received so far
    pub fn received(&self) -> FileRange {
        FileRange::new(self.range.begin, self.state.lock().end)
    }

    /// Abort the fetch; queued readers fail with a cancellation error
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn queue(&self, range: FileRange, min_length: u64) -> oneshot::Receiver<Result<Bytes>> {
        let (reply, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        state.requests.push(Request { range, reply });

        if state.end < self.range.end {
            self.dispatch(&mut state, min_length);
        }
        receiver
    }

    /// Answer every request that is contained in the received data, or
    /// that has at least `min_length` bytes of it
    fn dispatch(&self, state: &mut ContextState, min_length: u64) {
        let end = state.end;
        let (ready, waiting): (Vec<Request>, Vec<Request>) =
            std::mem::take(&mut state.requests)
                .into_iter()
                .partition(|request| {
                    let begin = request.range.begin;
                    begin < end && (request.range.end <= end || end - begin >= min_length)
                });
        state.requests = waiting;

        for request in ready {
            let from = (request.range.begin - self.range.begin) as usize;
            let to = (request.range.end.min(end) - self.range.begin) as usize;
            let data = Bytes::copy_from_slice(&state.buffer[from..to]);

            trace!(
                begin = request.range.begin,
                length = data.len(),
                "Dispatching partial read"
            );
            // The reader may have given up; nothing to do then.
            let _ = request.reply.send(Ok(data));
        }
    }
}

struct ManagerState {
    /// Bytes already written to the sink
    resident: FileRangeSet,
    active: Vec<Arc<PartialDownloadContext>>,
}

/// Tracks and fetches the resident ranges of one remote file
pub struct PartialDownloadManager {
    client: Arc<dyn RemoteClient>,
    runtime: Handle,
    handle: NodeHandle,
    size: u64,
    sink: Arc<dyn RangeSink>,
    config: DownloadConfig,
    token: CancellationToken,
    state: Mutex<ManagerState>,
    idle: Condvar,
}

enum Plan {
    Resident(FileRange),
    Wait(oneshot::Receiver<Result<Bytes>>),
}

impl PartialDownloadManager {
    /// Create a manager for a remote file with nothing resident yet
    ///
    /// # Arguments
    /// * `handle` - Remote file to fetch from
    /// * `size` - Remote size; reads are clipped to it
    /// * `sink` - Where arriving data is written
    pub fn new(
        client: Arc<dyn RemoteClient>,
        runtime: Handle,
        handle: NodeHandle,
        size: u64,
        sink: Arc<dyn RangeSink>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            client,
            runtime,
            handle,
            size,
            sink,
            config,
            token: CancellationToken::new(),
            state: Mutex::new(ManagerState {
                resident: FileRangeSet::new(),
                active: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether every byte of the file is resident
    pub fn is_complete(&self) -> bool {
        self.state.lock().resident.contains(FileRange::new(0, self.size))
    }

    /// Resident ranges
    pub fn resident(&self) -> Vec<FileRange> {
        self.state.lock().resident.iter().map(|(range, _)| range).collect()
    }

    /// Number of fetches in flight
    pub fn active(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Cancel every fetch, now and in the future
    pub fn cancel(&self) {
        debug!(handle = %self.handle, "Cancelling partial downloads");
        self.token.cancel();
    }

    /// Wait until no fetch is writing to the sink
    ///
    /// # Returns
    /// false if fetches were still running at the deadline
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.active.is_empty() {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.active.is_empty();
            }
        }
        true
    }

    /// Read from `range.begin`, fetching as needed
    ///
    /// A failed transfer fails the read at once; the caller decides whether
    /// to try again.
    ///
    /// # Returns
    /// Either all of `range` (clipped to the file size) or a prefix of it
    /// at least `min_chunk` bytes long. Empty at end of file.
    pub fn read(self: &Arc<Self>, range: FileRange) -> Result<Bytes> {
        self.read_with(range, 0)
    }

    fn read_with(self: &Arc<Self>, range: FileRange, retries: u32) -> Result<Bytes> {
        let range = FileRange::new(range.begin, range.end.min(self.size));
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let mut start = None;
        let plan = {
            let mut state = self.state.lock();

            if let Some((entry, _)) = state.resident.containing(range.begin) {
                Plan::Resident(FileRange::new(range.begin, range.end.min(entry.end)))
            } else if let Some(context) = state
                .active
                .iter()
                .find(|context| context.range.contains(range.begin))
            {
                Plan::Wait(context.queue(range, self.config.min_chunk))
            } else {
                let target = self.target(&state, range);
                let context = Arc::new(PartialDownloadContext::new(
                    target,
                    retries,
                    self.token.child_token(),
                ));
                let receiver = context.queue(range, self.config.min_chunk);
                state.active.push(Arc::clone(&context));
                start = Some(context);
                Plan::Wait(receiver)
            }
        };

        if let Some(context) = start {
            debug!(
                handle = %self.handle,
                range = %context.range,
                "Starting partial download"
            );
            self.runtime.spawn(Arc::clone(self).run(context));
        }

        match plan {
            Plan::Resident(resident) => Ok(self.sink.read_at(resident.begin, resident.len())?),
            Plan::Wait(receiver) => receiver.blocking_recv().map_err(|_| FsError::Cancelled)?,
        }
    }

    /// Make the whole file resident
    ///
    /// Fetches started here retry retryable failures up to `max_retries` times.
    pub fn fetch_all(self: &Arc<Self>) -> Result<()> {
        let whole = FileRange::new(0, self.size);
        loop {
            let gap = self.state.lock().resident.gaps(whole).first().copied();
            let Some(gap) = gap else {
                return Ok(());
            };

            if self.read_with(gap, self.config.max_retries)?.is_empty() {
                return Err(FsError::Network(format!(
                    "remote content ended before {} bytes",
                    self.size
                )));
            }
        }
    }

    /// Range a new fetch starting at `range.begin` should cover
    fn target(&self, state: &ManagerState, range: FileRange) -> FileRange {
        let wanted = range.end.max(range.begin.saturating_add(self.config.readahead));

        // Stop at the next range that is resident or already being fetched.
        let resident = state
            .resident
            .find(FileRange::new(range.begin, self.size))
            .into_iter()
            .map(|(entry, _)| entry.begin)
            .find(|&begin| begin > range.begin);
        let active = state
            .active
            .iter()
            .map(|context| context.range.begin)
            .filter(|&begin| begin > range.begin)
            .min();

        let limit = [Some(self.size), resident, active]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.size);
        FileRange::new(range.begin, wanted.min(limit))
    }

    async fn run(self: Arc<Self>, context: Arc<PartialDownloadContext>) {
        let mut attempt = 0;

        let result = loop {
            let offset = context.state.lock().end;
            if offset >= context.range.end {
                break Ok(());
            }

            match self.transfer(&context, offset).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempt < context.retries => {
                    attempt += 1;
                    warn!(
                        handle = %self.handle,
                        offset = offset,
                        attempt = attempt,
                        error = %e,
                        "Partial download failed, retrying"
                    );

                    let backoff = self.config.retry_backoff * attempt;
                    tokio::select! {
                        _ = context.token.cancelled() => break Err(FsError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        self.finish(&context, result);
    }

    async fn transfer(&self, context: &PartialDownloadContext, offset: u64) -> Result<()> {
        let length = context.range.end - offset;
        let mut stream = tokio::select! {
            _ = context.token.cancelled() => return Err(FsError::Cancelled),
            stream = self.client.partial_download(self.handle, offset, length) => stream?,
        };

        loop {
            let next = tokio::select! {
                _ = context.token.cancelled() => return Err(FsError::Cancelled),
                next = stream.next() => next,
            };

            match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(chunk)) => {
                    if self.receive(context, chunk)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Store a chunk and answer whoever it satisfies
    ///
    /// # Returns
    /// true once the target range is complete
    fn receive(&self, context: &PartialDownloadContext, chunk: Bytes) -> Result<bool> {
        let offset = context.state.lock().end;
        let usable = (context.range.end - offset).min(chunk.len() as u64) as usize;
        let chunk = chunk.slice(..usable);

        self.sink.write_at(offset, &chunk)?;

        let mut state = self.state.lock();
        let mut context_state = context.state.lock();
        context_state.buffer.extend_from_slice(&chunk);
        context_state.end += chunk.len() as u64;

        let end = context_state.end;
        state.resident.add(FileRange::new(context.range.begin, end), ());

        // The final chunk is dispatched by completion.
        if end < context.range.end {
            context.dispatch(&mut context_state, self.config.min_chunk);
        }
        Ok(end >= context.range.end)
    }

    fn finish(&self, context: &Arc<PartialDownloadContext>, result: Result<()>) {
        let remaining = {
            let mut state = self.state.lock();
            state.active.retain(|active| !Arc::ptr_eq(active, context));

            let mut context_state = context.state.lock();
            let received = FileRange::new(context.range.begin, context_state.end);
            state.resident.add(received, ());

            context.dispatch(&mut context_state, 1);
            context_state.buffer = Vec::new();
            std::mem::take(&mut context_state.requests)
        };
        self.idle.notify_all();

        match &result {
            Ok(()) => debug!(handle = %self.handle, range = %context.range, "Partial download complete"),
            Err(FsError::Cancelled) => debug!(handle = %self.handle, "Partial download cancelled"),
            Err(e) => warn!(handle = %self.handle, error = %e, "Partial download failed"),
        }

        // Whatever is left lies past the data we got.
        for request in remaining {
            let reply = match &result {
                Ok(()) => Ok(Bytes::new()),
                Err(e) => Err(e.clone()),
            };
            let _ = request.reply.send(reply);
        }
    }
}
