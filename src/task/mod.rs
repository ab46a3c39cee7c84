//! Deferred, cancellable work
//!
//! A [`Task`] wraps a closure that runs exactly once: either completed
//! normally or cancelled, in which case the closure still runs but sees
//! [`Task::cancelled`] return true so it can clean up.

mod executor;
mod queue;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

pub use executor::TaskExecutor;
pub use queue::TaskQueue;

const CANCELLABLE: u8 = 1;
const CANCELLED: u8 = 2;
const COMPLETED: u8 = 4;

type TaskFn = Box<dyn FnOnce(&Task) + Send>;

struct TaskInner {
    status: AtomicU8,
    body: Mutex<Option<TaskFn>>,
}

/// Shared handle to a unit of deferred work
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Wrap `body` in a new, pending task
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self {
            inner: Arc::new(TaskInner {
                status: AtomicU8::new(CANCELLABLE),
                body: Mutex::new(Some(Box::new(body))),
            }),
        }
    }

    /// Run the task as cancelled; false if it already ran
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED | COMPLETED)
    }

    /// Run the task normally; false if it already ran
    pub fn complete(&self) -> bool {
        self.transition(COMPLETED)
    }

    /// Whether the task was cancelled
    pub fn cancelled(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) & CANCELLED != 0
    }

    /// Whether the task has run, normally or cancelled
    pub fn completed(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) & COMPLETED != 0
    }

    /// Whether both handles refer to the same task
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn transition(&self, status: u8) -> bool {
        if self
            .inner
            .status
            .compare_exchange(CANCELLABLE, status, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // The body is released as soon as it has run.
        let body = self.inner.body.lock().take();
        if let Some(body) = body {
            if panic::catch_unwind(AssertUnwindSafe(|| body(self))).is_err() {
                error!(cancelled = self.cancelled(), "Task panicked");
            }
        }

        true
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("cancelled", &self.cancelled())
            .field("completed", &self.completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_complete_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = Task::new(move |task| {
            assert!(!task.cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.complete());
        assert!(!task.complete());
        assert!(!task.cancel());
        assert!(task.completed());
        assert!(!task.cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_runs_body_as_cancelled() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let task = Task::new(move |task| *record.lock() = Some(task.cancelled()));

        assert!(task.cancel());
        assert_eq!(*seen.lock(), Some(true));
        assert!(task.completed());
    }

    #[test]
    fn test_racing_complete_and_cancel() {
        for _ in 0..100 {
            let runs = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&runs);
            let task = Task::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let task = task.clone();
                    thread::spawn(move || if i % 2 == 0 { task.complete() } else { task.cancel() })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_panicking_body_is_contained() {
        let task = Task::new(|_| panic!("boom"));
        assert!(task.complete());
        assert!(task.completed());
    }
}
