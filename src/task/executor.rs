//! Elastic worker pool
//!
//! Runs queued tasks at their due time on a pool of worker threads that
//! grows on demand up to `max_workers` and shrinks back towards
//! `min_workers` after `idle_time` without work.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use super::{Task, TaskQueue};
use crate::config::ExecutorConfig;

struct State {
    config: ExecutorConfig,
    queue: TaskQueue,
    /// Live workers by id; a worker removes itself when it retires
    workers: HashMap<u64, JoinHandle<()>>,
    /// Workers currently waiting for work
    available: usize,
    next_worker: u64,
    terminate: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// Pool of worker threads running [`Task`]s at their due time
pub struct TaskExecutor {
    shared: Arc<Shared>,
}

impl TaskExecutor {
    /// Create an executor; workers are spawned on demand
    pub fn new(config: ExecutorConfig) -> Self {
        debug!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            idle_ms = config.idle_time.as_millis() as u64,
            "Task executor created"
        );

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    queue: TaskQueue::new(),
                    workers: HashMap::new(),
                    available: 0,
                    next_worker: 0,
                    terminate: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Queue `body` to run at `when`
    ///
    /// # Arguments
    /// * `body` - Work to run; it also runs, cancelled, if the executor shuts down first
    /// * `when` - Due time
    /// * `spawn_worker` - Ask for a new worker when none is idle
    ///
    /// # Returns
    /// Handle that can cancel or force the task
    pub fn execute<F>(&self, body: F, when: Instant, spawn_worker: bool) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let task = Task::new(body);
        let mut state = self.shared.state.lock();

        if state.terminate {
            drop(state);
            task.cancel();
            return task;
        }

        state.queue.queue(task.clone(), when);

        let workers = state.workers.len();
        let wanted = (spawn_worker && state.available == 0) || workers == 0;
        if wanted && workers < state.config.max_workers {
            self.spawn(&mut state);
        }

        drop(state);
        self.shared.wakeup.notify_one();
        task
    }

    /// Queue `body` to run after `delay`
    pub fn execute_after<F>(&self, body: F, delay: Duration, spawn_worker: bool) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.execute(body, Instant::now() + delay, spawn_worker)
    }

    /// Current pool sizing
    pub fn config(&self) -> ExecutorConfig {
        self.shared.state.lock().config
    }

    /// Change pool sizing; surplus workers retire as they wake
    pub fn set_config(&self, config: ExecutorConfig) {
        let mut state = self.shared.state.lock();
        state.config = config;

        while !state.terminate && state.workers.len() < config.min_workers {
            if !self.spawn(&mut state) {
                break;
            }
        }

        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Number of live workers
    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Cancel queued tasks and join every worker
    ///
    /// Tasks submitted afterwards are cancelled immediately.
    pub fn shutdown(&self) {
        let (queue, workers) = {
            let mut state = self.shared.state.lock();
            if state.terminate && state.workers.is_empty() {
                return;
            }
            state.terminate = true;

            let queue = std::mem::take(&mut state.queue);
            let workers: Vec<_> = state.workers.drain().map(|(_, handle)| handle).collect();
            (queue, workers)
        };

        self.shared.wakeup.notify_all();

        debug!(
            pending = queue.len(),
            workers = workers.len(),
            "Task executor shutting down"
        );

        // Dropping the queue cancels what is left in it.
        drop(queue);

        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Executor worker panicked");
            }
        }
    }

    fn spawn(&self, state: &mut MutexGuard<'_, State>) -> bool {
        let id = state.next_worker;
        state.next_worker += 1;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("executor-{}", id))
            .spawn(move || run(shared, id));

        match spawned {
            Ok(handle) => {
                state.workers.insert(id, handle);
                trace!(worker = id, workers = state.workers.len(), "Spawned worker");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn executor worker");
                false
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop
fn run(shared: Arc<Shared>, id: u64) {
    let mut state = shared.state.lock();

    loop {
        if state.terminate {
            break;
        }

        if state.workers.len() > state.config.max_workers {
            retire(&mut state, id);
            break;
        }

        let now = Instant::now();
        if let Some(task) = state.queue.dequeue_due(now) {
            drop(state);
            task.complete();
            state = shared.state.lock();
            continue;
        }

        let idle_deadline = now + state.config.idle_time;
        let deadline = state
            .queue
            .when()
            .map_or(idle_deadline, |when| when.min(idle_deadline));

        state.available += 1;
        let timed_out = shared.wakeup.wait_until(&mut state, deadline).timed_out();
        state.available -= 1;

        if !timed_out || deadline < idle_deadline || state.terminate {
            continue;
        }

        if state.queue.ready(Instant::now()) {
            continue;
        }

        let workers = state.workers.len();
        if workers <= state.config.min_workers {
            continue;
        }

        // Someone has to stay behind for work that is queued but not yet due.
        if !state.queue.is_empty() && workers < 2 {
            continue;
        }

        retire(&mut state, id);
        break;
    }

    drop(state);
    trace!(worker = id, "Worker exiting");
}

/// Detach the calling worker from the pool
fn retire(state: &mut MutexGuard<'_, State>, id: u64) {
    // Dropping our own handle detaches the thread.
    state.workers.remove(&id);
}
