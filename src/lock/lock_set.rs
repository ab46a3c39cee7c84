//! Deadlock-free acquisition of several locks at once
//!
//! Each round blocks on one lock and only tries the rest. When a try fails,
//! everything is released and the next round blocks on the lock that failed,
//! so a thread never waits while holding anything from the set.

use std::thread;

use parking_lot::{Mutex, MutexGuard};

use super::shared_mutex::{SharedMutex, UniqueGuard};

/// A lock that can be taken blocking or tried
pub trait Lockable {
    type Guard<'a>
    where
        Self: 'a;

    fn lock(&self) -> Self::Guard<'_>;

    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

impl Lockable for SharedMutex {
    type Guard<'a> = UniqueGuard<'a>;

    fn lock(&self) -> UniqueGuard<'_> {
        SharedMutex::lock(self)
    }

    fn try_lock(&self) -> Option<UniqueGuard<'_>> {
        SharedMutex::try_lock(self)
    }
}

impl<T> Lockable for Mutex<T> {
    type Guard<'a> = MutexGuard<'a, T> where Self: 'a;

    fn lock(&self) -> MutexGuard<'_, T> {
        Mutex::lock(self)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        Mutex::try_lock(self)
    }
}

/// Lock every lock in `locks`, returning the guards in input order
///
/// Non-recursive locks must not appear twice in the set.
pub fn lock_all<'a, L>(locks: &[&'a L]) -> Vec<L::Guard<'a>>
where
    L: Lockable + ?Sized,
{
    let count = locks.len();
    let mut first = 0;

    loop {
        let mut held: Vec<Option<L::Guard<'a>>> = (0..count).map(|_| None).collect();
        let mut failed = None;

        if let Some(lock) = locks.get(first) {
            held[first] = Some(lock.lock());
        }

        for step in 1..count {
            let index = (first + step) % count;
            match locks[index].try_lock() {
                Some(guard) => held[index] = Some(guard),
                None => {
                    failed = Some(index);
                    break;
                }
            }
        }

        match failed {
            None => return held.into_iter().flatten().collect(),
            Some(index) => {
                drop(held);
                first = index;
                thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_set() {
        let locks: [&Mutex<u32>; 0] = [];
        assert!(lock_all(&locks).is_empty());
    }

    #[test]
    fn test_guards_in_input_order() {
        let a = Mutex::new(1);
        let b = Mutex::new(2);
        let c = Mutex::new(3);

        let guards = lock_all(&[&c, &a, &b]);
        let values: Vec<u32> = guards.iter().map(|g| **g).collect();
        assert_eq!(values, vec![3, 1, 2]);
    }

    #[test]
    fn test_opposite_orders_do_not_deadlock() {
        let a = Arc::new(SharedMutex::new());
        let b = Arc::new(SharedMutex::new());
        let counter = Arc::new(Mutex::new(0u32));

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let (a, b, counter) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&counter));
                thread::spawn(move || {
                    for _ in 0..500 {
                        let guards = if i % 2 == 0 {
                            lock_all(&[&*a, &*b])
                        } else {
                            lock_all(&[&*b, &*a])
                        };
                        *counter.lock() += 1;
                        drop(guards);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 2000);
    }

    #[test]
    fn test_waits_for_busy_lock() {
        let a = Arc::new(Mutex::new(0));
        let b = Arc::new(Mutex::new(0));

        let held = b.lock();
        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        let worker = thread::spawn(move || {
            let mut guards = lock_all(&[&*a2, &*b2]);
            *guards[0] += 1;
            *guards[1] += 1;
        });

        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!worker.is_finished());
        drop(held);
        worker.join().unwrap();

        assert_eq!(*a.lock(), 1);
        assert_eq!(*b.lock(), 1);
    }
}
