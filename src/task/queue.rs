//! Deadline-ordered task queue

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::Task;

struct Entry {
    when: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the heap pops the earliest deadline, oldest first on ties.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of tasks keyed by due time
///
/// Tasks still queued when the queue is dropped are cancelled.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to run at `when`
    ///
    /// # Returns
    /// false if the task has already run and was not queued
    pub fn queue(&mut self, task: Task, when: Instant) -> bool {
        if task.completed() {
            return false;
        }

        self.seq += 1;
        self.heap.push(Entry {
            when,
            seq: self.seq,
            task,
        });
        true
    }

    /// Remove the earliest task regardless of its due time
    pub fn dequeue(&mut self) -> Option<(Instant, Task)> {
        self.heap.pop().map(|entry| (entry.when, entry.task))
    }

    /// Remove the earliest task if it is due at `now`
    pub fn dequeue_due(&mut self, now: Instant) -> Option<Task> {
        if self.ready(now) {
            self.heap.pop().map(|entry| entry.task)
        } else {
            None
        }
    }

    /// Remove up to `count` tasks in due order
    pub fn dequeue_many(&mut self, count: usize) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(count.min(self.heap.len()));
        while tasks.len() < count {
            match self.heap.pop() {
                Some(entry) => tasks.push(entry.task),
                None => break,
            }
        }
        tasks
    }

    /// Due time of the earliest task
    pub fn when(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.when)
    }

    /// Whether the earliest task is due at `now`
    pub fn ready(&self, now: Instant) -> bool {
        self.when().is_some_and(|when| when <= now)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        for entry in self.heap.drain() {
            entry.task.cancel();
        }
    }
}
