//! Platform seam
//!
//! A [`Platform`] turns an enabled [`Mount`] into a live session with the
//! operating system. The session stays mounted for as long as its
//! [`Session`] value is held.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{Invalidator, Mount, MountError, RecordingInvalidator};

/// Something that can present mounts to the operating system
pub trait Platform: Send + Sync {
    fn mount(&self, mount: Arc<Mount>) -> Result<Session, MountError>;
}

/// A live platform session; dropping it unmounts
pub struct Session {
    invalidator: Arc<dyn Invalidator>,
    _guard: Box<dyn Any + Send>,
}

impl Session {
    /// # Arguments
    /// * `invalidator` - Where engine invalidations for this session go
    /// * `guard` - Held for the life of the session and dropped to unmount
    pub fn new(invalidator: Arc<dyn Invalidator>, guard: impl Any + Send) -> Self {
        Self {
            invalidator,
            _guard: Box::new(guard),
        }
    }

    pub fn invalidator(&self) -> Arc<dyn Invalidator> {
        Arc::clone(&self.invalidator)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct NullState {
    mounted: BTreeSet<String>,
    refuse: bool,
}

/// Platform that mounts nothing and records what it is told
///
/// Used when the engine runs without a kernel filesystem, and in tests.
#[derive(Default)]
pub struct NullPlatform {
    state: Arc<Mutex<NullState>>,
    invalidations: Arc<RecordingInvalidator>,
}

struct NullGuard {
    name: String,
    state: Arc<Mutex<NullState>>,
}

impl Drop for NullGuard {
    fn drop(&mut self) {
        self.state.lock().mounted.remove(&self.name);
        debug!(mount = %self.name, "Null session ended");
    }
}

impl NullPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the mounts with a live session
    pub fn mounted(&self) -> Vec<String> {
        self.state.lock().mounted.iter().cloned().collect()
    }

    /// Make every following mount attempt fail
    pub fn refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Invalidations received by every session so far
    pub fn invalidations(&self) -> &RecordingInvalidator {
        &self.invalidations
    }
}

impl Platform for NullPlatform {
    fn mount(&self, mount: Arc<Mount>) -> Result<Session, MountError> {
        let name = mount.name();
        {
            let mut state = self.state.lock();
            if state.refuse {
                return Err(MountError::Platform(format!("refused to mount {}", name)));
            }
            state.mounted.insert(name.clone());
        }

        debug!(mount = %name, path = %mount.path().display(), "Null session started");
        let guard = NullGuard {
            name,
            state: Arc::clone(&self.state),
        };
        Ok(Session::new(
            Arc::clone(&self.invalidations) as Arc<dyn Invalidator>,
            guard,
        ))
    }
}
