//! Upgradeable, recursive reader/writer lock
//!
//! Many threads may hold the lock shared, or one thread may hold it
//! exclusively. The exclusive owner can lock again in either mode, and a
//! sole shared holder can upgrade. Downgrading an exclusive hold lets
//! waiting readers in without giving a writer the chance to cut ahead.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    /// Positive: shared holders. Zero: free. Negative: exclusive depth.
    count: isize,
    /// Thread holding the lock exclusively
    owner: Option<ThreadId>,
}

impl State {
    fn owned_by(&self, me: ThreadId) -> bool {
        self.count < 0 && self.owner == Some(me)
    }
}

/// Reader/writer lock supporting recursion, upgrade and downgrade
#[derive(Debug, Default)]
pub struct SharedMutex {
    state: Mutex<State>,
    readers: Condvar,
    writers: Condvar,
}

/// Shared hold on a [`SharedMutex`]; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a SharedMutex,
    /// Taken by the exclusive owner, so it counts as an exclusive level
    nested: bool,
    _not_send: PhantomData<*const ()>,
}

/// Exclusive hold on a [`SharedMutex`]; released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct UniqueGuard<'a> {
    lock: &'a SharedMutex,
    _not_send: PhantomData<*const ()>,
}

/// Wait on `condvar`, honouring an optional deadline.
///
/// Returns false once the deadline has passed.
fn wait(condvar: &Condvar, state: &mut MutexGuard<'_, State>, deadline: Option<Instant>) -> bool {
    match deadline {
        None => {
            condvar.wait(state);
            true
        }
        Some(deadline) => !condvar.wait_until(state, deadline).timed_out(),
    }
}

impl SharedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_shared(&self, deadline: Option<Instant>) -> Option<SharedGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            if state.owned_by(me) {
                state.count -= 1;
                return Some(SharedGuard::new(self, true));
            }

            if state.count >= 0 {
                state.count += 1;
                return Some(SharedGuard::new(self, false));
            }

            if !wait(&self.readers, &mut state, deadline) && state.count < 0 {
                return None;
            }
        }
    }

    fn acquire_unique(&self, deadline: Option<Instant>) -> Option<UniqueGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            if state.count == 0 {
                state.count = -1;
                state.owner = Some(me);
                return Some(UniqueGuard::new(self));
            }

            if state.owned_by(me) {
                state.count -= 1;
                return Some(UniqueGuard::new(self));
            }

            if !wait(&self.writers, &mut state, deadline) && state.count != 0 {
                return None;
            }
        }
    }

    /// Acquire a shared hold, blocking while another thread holds the lock exclusively
    pub fn lock_shared(&self) -> SharedGuard<'_> {
        loop {
            if let Some(guard) = self.acquire_shared(None) {
                return guard;
            }
        }
    }

    /// Acquire a shared hold if no other thread holds the lock exclusively
    pub fn try_lock_shared(&self) -> Option<SharedGuard<'_>> {
        self.acquire_shared(Some(Instant::now()))
    }

    /// Acquire a shared hold, giving up at `deadline`
    pub fn try_lock_shared_until(&self, deadline: Instant) -> Option<SharedGuard<'_>> {
        self.acquire_shared(Some(deadline))
    }

    /// Acquire a shared hold, giving up after `timeout`
    pub fn try_lock_shared_for(&self, timeout: Duration) -> Option<SharedGuard<'_>> {
        self.acquire_shared(Some(Instant::now() + timeout))
    }

    /// Acquire an exclusive hold, blocking until every other holder is gone
    pub fn lock(&self) -> UniqueGuard<'_> {
        loop {
            if let Some(guard) = self.acquire_unique(None) {
                return guard;
            }
        }
    }

    /// Acquire an exclusive hold without blocking
    pub fn try_lock(&self) -> Option<UniqueGuard<'_>> {
        self.acquire_unique(Some(Instant::now()))
    }

    /// Acquire an exclusive hold, giving up at `deadline`
    pub fn try_lock_until(&self, deadline: Instant) -> Option<UniqueGuard<'_>> {
        self.acquire_unique(Some(deadline))
    }

    /// Acquire an exclusive hold, giving up after `timeout`
    pub fn try_lock_for(&self, timeout: Duration) -> Option<UniqueGuard<'_>> {
        self.acquire_unique(Some(Instant::now() + timeout))
    }

    /// Whether any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.state.lock().count != 0
    }

    /// Whether the calling thread holds the lock exclusively
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owned_by(thread::current().id())
    }

    fn release_unique(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.count < 0, "exclusive release of a lock not held exclusively");

        state.count += 1;
        if state.count == 0 {
            state.owner = None;
            drop(state);
            self.readers.notify_all();
            self.writers.notify_all();
        }
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.count > 0, "shared release of a lock not held shared");

        state.count -= 1;
        // Zero wakes a writer; one wakes a holder waiting to upgrade.
        if state.count <= 1 {
            drop(state);
            self.writers.notify_all();
        }
    }
}

impl<'a> SharedGuard<'a> {
    fn new(lock: &'a SharedMutex, nested: bool) -> Self {
        Self {
            lock,
            nested,
            _not_send: PhantomData,
        }
    }

    fn convert(self, deadline: Option<Instant>) -> Result<UniqueGuard<'a>, SharedGuard<'a>> {
        let lock = self.lock;

        // Inside an exclusive hold the level is already exclusive.
        if self.nested {
            std::mem::forget(self);
            return Ok(UniqueGuard::new(lock));
        }

        let mut state = lock.state.lock();
        loop {
            if state.count == 1 {
                state.count = -1;
                state.owner = Some(thread::current().id());
                drop(state);
                std::mem::forget(self);
                return Ok(UniqueGuard::new(lock));
            }

            if !wait(&lock.writers, &mut state, deadline) && state.count != 1 {
                drop(state);
                return Err(self);
            }
        }
    }

    /// Upgrade to an exclusive hold once this is the only shared holder
    ///
    /// Two holders waiting to upgrade at the same time block each other.
    pub fn upgrade(self) -> UniqueGuard<'a> {
        let mut guard = self;
        loop {
            match guard.convert(None) {
                Ok(unique) => return unique,
                Err(shared) => guard = shared,
            }
        }
    }

    /// Try to upgrade before `deadline`, handing the shared hold back on failure
    pub fn try_upgrade_until(self, deadline: Instant) -> Result<UniqueGuard<'a>, SharedGuard<'a>> {
        self.convert(Some(deadline))
    }

    /// Try to upgrade within `timeout`, handing the shared hold back on failure
    pub fn try_upgrade_for(self, timeout: Duration) -> Result<UniqueGuard<'a>, SharedGuard<'a>> {
        self.convert(Some(Instant::now() + timeout))
    }

    /// Release the hold
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if self.nested {
            self.lock.release_unique();
        } else {
            self.lock.release_shared();
        }
    }
}

impl<'a> UniqueGuard<'a> {
    fn new(lock: &'a SharedMutex) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Convert to a shared hold without letting a writer in between
    ///
    /// A recursive hold keeps the outer exclusive levels, so the result
    /// nests inside them.
    pub fn downgrade(self) -> SharedGuard<'a> {
        let lock = self.lock;
        let mut state = lock.state.lock();

        if state.count < -1 {
            drop(state);
            std::mem::forget(self);
            return SharedGuard::new(lock, true);
        }

        state.count = 1;
        state.owner = None;
        drop(state);
        std::mem::forget(self);

        lock.readers.notify_all();
        SharedGuard::new(lock, false)
    }

    /// Release the hold
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for UniqueGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_unique();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Run `f` on another thread and return its result
    fn elsewhere<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        thread::spawn(f).join().unwrap()
    }

    #[test]
    fn test_lock_succeeds() {
        let lock = SharedMutex::new();
        let guard = lock.lock();
        assert!(lock.is_owned_by_current_thread());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_fails_while_held_elsewhere() {
        let lock = Arc::new(SharedMutex::new());
        let _guard = lock.lock_shared();

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock().is_none()));

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock_for(Duration::from_millis(20)).is_none()));
    }

    #[test]
    fn test_lock_recursive_succeeds() {
        let lock = Arc::new(SharedMutex::new());
        let outer = lock.lock();
        let inner = lock.try_lock().expect("recursive exclusive");
        let shared = lock.try_lock_shared().expect("shared inside exclusive");

        drop(shared);
        drop(inner);
        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock_shared().is_none()));

        drop(outer);
        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock().is_some()));
    }

    #[test]
    fn test_shared_lock_succeeds() {
        let lock = Arc::new(SharedMutex::new());
        let _first = lock.lock_shared();

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock_shared().is_some()));

        let _second = lock.try_lock_shared().expect("recursive shared");
    }

    #[test]
    fn test_shared_lock_fails_while_writer_holds() {
        let lock = Arc::new(SharedMutex::new());
        let _guard = lock.lock();

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock_shared().is_none()));
    }

    #[test]
    fn test_downgrade_admits_readers() {
        let lock = Arc::new(SharedMutex::new());
        let shared = lock.lock().downgrade();

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock_shared().is_some()));

        let other = Arc::clone(&lock);
        assert!(elsewhere(move || other.try_lock().is_none()));

        drop(shared);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_upgrade_succeeds_when_sole_reader() {
        let lock = Arc::new(SharedMutex::new());
        let unique = lock
            .lock_shared()
            .try_upgrade_for(Duration::from_millis(64))
            .ok()
            .expect("sole reader upgrades");
        assert!(lock.is_owned_by_current_thread());
        drop(unique);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let lock = Arc::new(SharedMutex::new());
        let shared = lock.lock_shared();

        let (tx, rx) = std::sync::mpsc::channel();
        let other = Arc::clone(&lock);
        let reader = thread::spawn(move || {
            let guard = other.lock_shared();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            drop(guard);
        });
        rx.recv().unwrap();

        // Another reader is present so a quick attempt fails and keeps the hold.
        let shared = shared
            .try_upgrade_for(Duration::from_millis(5))
            .err()
            .expect("upgrade blocked by second reader");

        let unique = shared.upgrade();
        assert!(lock.is_owned_by_current_thread());
        drop(unique);
        reader.join().unwrap();
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = Arc::new(SharedMutex::new());
        let shared = lock.lock_shared();

        let other = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let _guard = other.lock();
            Instant::now()
        });

        thread::sleep(Duration::from_millis(30));
        let released = Instant::now();
        drop(shared);

        assert!(writer.join().unwrap() >= released);
    }
}
