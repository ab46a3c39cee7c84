//! Kernel cache invalidation
//!
//! The engine announces attribute, data and directory entry changes through
//! an [`Invalidator`]. The [`InvalidationHub`] fans each notice out to every
//! mounted session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::inode::InodeID;

/// Receiver of cache invalidation notices
pub trait Invalidator: Send + Sync {
    /// Attributes of `id` changed
    fn attributes(&self, id: InodeID);

    /// Content of `id` in `[offset, offset + length)` changed; a zero
    /// length means everything from `offset` on
    fn data(&self, id: InodeID, offset: u64, length: u64);

    /// Entry `name` in directory `parent` changed or vanished
    fn entry(&self, parent: InodeID, name: &str);
}

/// Registration with an [`InvalidationHub`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HubToken(u64);

#[derive(Default)]
struct HubState {
    next: u64,
    targets: HashMap<u64, Arc<dyn Invalidator>>,
}

/// Fan-out of invalidations to every registered session
#[derive(Default)]
pub struct InvalidationHub {
    state: Mutex<HubState>,
}

impl InvalidationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: Arc<dyn Invalidator>) -> HubToken {
        let mut state = self.state.lock();
        state.next += 1;
        let token = state.next;
        state.targets.insert(token, target);
        HubToken(token)
    }

    pub fn unregister(&self, token: HubToken) -> bool {
        self.state.lock().targets.remove(&token.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn targets(&self) -> Vec<Arc<dyn Invalidator>> {
        self.state.lock().targets.values().cloned().collect()
    }
}

// Targets are called outside the hub lock; a session may call back in.
impl Invalidator for InvalidationHub {
    fn attributes(&self, id: InodeID) {
        trace!(id = %id, "Invalidating attributes");
        for target in self.targets() {
            target.attributes(id);
        }
    }

    fn data(&self, id: InodeID, offset: u64, length: u64) {
        trace!(id = %id, offset = offset, length = length, "Invalidating data");
        for target in self.targets() {
            target.data(id, offset, length);
        }
    }

    fn entry(&self, parent: InodeID, name: &str) {
        trace!(parent = %parent, name = name, "Invalidating entry");
        for target in self.targets() {
            target.entry(parent, name);
        }
    }
}

/// Notice recorded by a [`RecordingInvalidator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Attributes(InodeID),
    Data { id: InodeID, offset: u64, length: u64 },
    Entry { parent: InodeID, name: String },
}

/// Invalidator that keeps every notice it receives
#[derive(Default)]
pub struct RecordingInvalidator {
    seen: Mutex<Vec<Invalidation>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far, oldest first
    pub fn take(&self) -> Vec<Invalidation> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl Invalidator for RecordingInvalidator {
    fn attributes(&self, id: InodeID) {
        self.seen.lock().push(Invalidation::Attributes(id));
    }

    fn data(&self, id: InodeID, offset: u64, length: u64) {
        self.seen.lock().push(Invalidation::Data { id, offset, length });
    }

    fn entry(&self, parent: InodeID, name: &str) {
        self.seen.lock().push(Invalidation::Entry {
            parent,
            name: name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fans_out_until_unregistered() {
        let hub = InvalidationHub::new();
        let first = Arc::new(RecordingInvalidator::new());
        let second = Arc::new(RecordingInvalidator::new());

        let token = hub.register(Arc::clone(&first) as Arc<dyn Invalidator>);
        hub.register(Arc::clone(&second) as Arc<dyn Invalidator>);

        hub.attributes(InodeID::new(7));
        assert!(hub.unregister(token));
        assert!(!hub.unregister(token));
        hub.entry(InodeID::new(2), "gone");

        assert_eq!(first.take(), vec![Invalidation::Attributes(InodeID::new(7))]);
        assert_eq!(
            second.take(),
            vec![
                Invalidation::Attributes(InodeID::new(7)),
                Invalidation::Entry {
                    parent: InodeID::new(2),
                    name: "gone".into()
                },
            ]
        );
    }
}
