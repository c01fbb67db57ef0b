//! Named Lock Registry
//!
//! Process-wide map from a canonical masking view name to a mutex, created on
//! demand. Attach and teardown calls for the same view serialize on it; calls
//! for different views proceed in parallel.
//!
//! Exclusion is intra-process only. Separate processes converge through the
//! deterministic naming scheme and the array's own uniqueness rules.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;
use tracing::trace;

/// Registry of named mutexes
#[derive(Debug, Default)]
pub struct NamedLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock on one name; released on drop
pub struct NamedLockGuard {
    name: String,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        trace!(lock = %self.name, "Released named lock");
    }
}

impl NamedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `name` is held
    pub fn lock(&self, name: &str) -> NamedLockGuard {
        // Clone the Arc first so the shard lock is not held while blocking
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = mutex.lock_arc();
        trace!(lock = %name, "Acquired named lock");
        NamedLockGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Whether someone currently holds the lock for `name`
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .map(|entry| entry.value().is_locked())
            .unwrap_or(false)
    }

    /// Number of names with a registered mutex
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop mutexes nobody holds or waits on, returning how many were removed
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }
}
