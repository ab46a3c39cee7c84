//! Recently used inodes
//!
//! Keeps strong references to recently touched inodes so they survive
//! between kernel requests. A background cleaner trims the least recently
//! used entries once the cache grows past its size threshold, but never an
//! entry younger than the age threshold.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use super::{InodeID, InodeRef};
use crate::config::InodeCacheConfig;

struct Entry {
    inode: InodeRef,
    touched: Instant,
}

struct State {
    config: InodeCacheConfig,
    /// Entries by recency; the highest sequence is the most recent
    entries: BTreeMap<u64, Entry>,
    positions: HashMap<InodeID, u64>,
    sequence: u64,
    terminate: bool,
}

impl State {
    /// Drop entries from the tail while over `size`, stopping at the first
    /// entry younger than `age` when `age` is non-zero
    fn reduce(&mut self, age: Duration, size: usize) -> Vec<InodeRef> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        while self.entries.len() > size {
            let Some(mut oldest) = self.entries.first_entry() else {
                break;
            };
            if !age.is_zero() && now.duration_since(oldest.get().touched) < age {
                break;
            }

            let entry = oldest.remove();
            self.positions.remove(&entry.inode.id());
            evicted.push(entry.inode);
        }
        evicted
    }
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// Most-recently-used cache of inode references with a background cleaner
pub struct InodeCache {
    shared: Arc<Shared>,
    cleaner: Option<JoinHandle<()>>,
}

impl InodeCache {
    pub fn new(config: InodeCacheConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                config,
                entries: BTreeMap::new(),
                positions: HashMap::new(),
                sequence: 0,
                terminate: false,
            }),
            wakeup: Condvar::new(),
        });

        let cleaner = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("inode-cache".into())
                .spawn(move || clean(shared))
        };
        let cleaner = match cleaner {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to start inode cache cleaner");
                None
            }
        };

        Self { shared, cleaner }
    }

    /// Insert `inode` or move it to the front
    ///
    /// # Returns
    /// true if the inode was not cached before
    pub fn add(&self, inode: &InodeRef) -> bool {
        let mut state = self.shared.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;

        let previous = state.positions.insert(inode.id(), sequence);
        if let Some(previous) = previous {
            state.entries.remove(&previous);
        }

        state.entries.insert(
            sequence,
            Entry {
                inode: Arc::clone(inode),
                touched: Instant::now(),
            },
        );
        previous.is_none()
    }

    /// Drop the entry for `id`, handing back its reference
    pub fn remove(&self, id: InodeID) -> Option<InodeRef> {
        let removed = {
            let mut state = self.shared.state.lock();
            let sequence = state.positions.remove(&id)?;
            state.entries.remove(&sequence)
        };
        removed.map(|entry| entry.inode)
    }

    pub fn contains(&self, id: InodeID) -> bool {
        self.shared.state.lock().positions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the cache, returning every reference it held
    pub fn clear(&self) -> Vec<InodeRef> {
        let mut state = self.shared.state.lock();
        state.positions.clear();
        std::mem::take(&mut state.entries)
            .into_values()
            .map(|entry| entry.inode)
            .collect()
    }

    /// Evict down to `size` entries, sparing entries younger than `age`
    ///
    /// The evicted references are returned so the caller releases them
    /// outside the cache lock.
    pub fn reduce(&self, age: Duration, size: usize) -> Vec<InodeRef> {
        self.shared.state.lock().reduce(age, size)
    }

    pub fn config(&self) -> InodeCacheConfig {
        self.shared.state.lock().config
    }

    /// Change the eviction policy and wake the cleaner
    pub fn set_config(&self, config: InodeCacheConfig) {
        self.shared.state.lock().config = config;
        self.shared.wakeup.notify_all();
    }
}

impl Drop for InodeCache {
    fn drop(&mut self) {
        self.shared.state.lock().terminate = true;
        self.shared.wakeup.notify_all();

        if let Some(cleaner) = self.cleaner.take() {
            if cleaner.join().is_err() {
                error!("Inode cache cleaner panicked");
            }
        }

        let released = self.clear();
        debug!(released = released.len(), "Inode cache shut down");
    }
}

/// Cleaner loop
///
/// Runs a pass at every wake: each interval, and at once when the
/// configuration changes.
fn clean(shared: Arc<Shared>) {
    let mut state = shared.state.lock();

    while !state.terminate {
        let interval = state.config.clean_interval;
        if interval.is_zero() {
            shared.wakeup.wait(&mut state);
        } else {
            shared.wakeup.wait_for(&mut state, interval);
        }
        if state.terminate {
            break;
        }

        let config = state.config;
        let evicted = state.reduce(config.clean_age_threshold, config.clean_size_threshold);
        if evicted.is_empty() {
            continue;
        }

        // Release outside the lock; dropping an inode may run arbitrary cleanup.
        drop(state);
        trace!(evicted = evicted.len(), "Inode cache cleaned");
        drop(evicted);
        state = shared.state.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::Inode;

    fn inode(id: u64) -> InodeRef {
        Arc::new(Inode::detached_file(InodeID::new(id), &format!("f{}", id)))
    }

    fn idle() -> InodeCacheConfig {
        InodeCacheConfig {
            clean_age_threshold: Duration::ZERO,
            clean_interval: Duration::ZERO,
            clean_size_threshold: 2,
        }
    }

    #[test]
    fn test_add_reports_new_entries() {
        let cache = InodeCache::new(idle());
        let a = inode(2);

        assert!(cache.add(&a));
        assert!(!cache.add(&a));
        assert_eq!(cache.len(), 1);
        assert_eq!(Arc::strong_count(&a), 2);

        assert!(cache.remove(a.id()).is_some());
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_reduce_evicts_least_recent() {
        let cache = InodeCache::new(idle());
        let inodes: Vec<_> = (2..7).map(inode).collect();
        for inode in &inodes {
            cache.add(inode);
        }
        // Touch the oldest so it moves to the front.
        cache.add(&inodes[0]);

        let evicted: Vec<u64> = cache
            .reduce(Duration::ZERO, 2)
            .iter()
            .map(|inode| inode.id().get())
            .collect();

        assert_eq!(evicted, vec![3, 4, 5]);
        assert!(cache.contains(InodeID::new(2)));
        assert!(cache.contains(InodeID::new(6)));
    }

    #[test]
    fn test_age_gate_spares_young_entries() {
        let cache = InodeCache::new(idle());
        for id in 2..7 {
            cache.add(&inode(id));
        }

        assert!(cache.reduce(Duration::from_secs(60), 2).is_empty());
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_cleaner_enforces_ceiling() {
        let cache = InodeCache::new(idle());
        for id in 2..12 {
            cache.add(&inode(id));
        }
        assert_eq!(cache.len(), 10);

        cache.set_config(InodeCacheConfig {
            clean_interval: Duration::from_millis(10),
            ..idle()
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.len() > 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_config_change_cleans_at_once() {
        let cache = InodeCache::new(InodeCacheConfig {
            clean_interval: Duration::from_secs(10),
            clean_size_threshold: 64,
            ..idle()
        });
        for id in 2..12 {
            cache.add(&inode(id));
        }

        cache.set_config(InodeCacheConfig {
            clean_interval: Duration::from_secs(10),
            ..idle()
        });

        let deadline = Instant::now() + Duration::from_millis(500);
        while cache.len() > 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear_returns_references() {
        let cache = InodeCache::new(idle());
        let a = inode(2);
        cache.add(&a);

        let released = cache.clear();
        assert_eq!(released.len(), 1);
        assert!(cache.is_empty());
    }
}
