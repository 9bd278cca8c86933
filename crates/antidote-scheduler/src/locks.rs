//! Per-lab lifecycle locks
//!
//! Every workflow touching one lab (CREATE, MODIFY, DELETE, and GC
//! deletion) holds that lab's lock for its whole duration, so a DELETE
//! racing an in-flight CREATE waits for it instead of tearing the lab down
//! underneath it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of async mutexes keyed by LiveLesson ID
///
/// Thread-safe using DashMap so lookups for unrelated labs never contend.
#[derive(Default)]
pub struct LabLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LabLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a lab
    pub async fn lock(&self, live_lesson_id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await
        let lock = self
            .locks
            .entry(live_lesson_id.to_string())
            .or_default()
            .value()
            .clone();
        trace!(live_lesson = %live_lesson_id, "waiting for lab lock");
        lock.lock_owned().await
    }

    /// Drop the entry for a lab that no longer exists
    ///
    /// Entries still held or awaited elsewhere are kept.
    pub fn forget(&self, live_lesson_id: &str) {
        self.locks
            .remove_if(live_lesson_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of labs with a registered lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no lock is registered
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
