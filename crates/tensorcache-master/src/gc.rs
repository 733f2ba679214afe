//! Delayed garbage-collection tasks.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Capacity of the lock-free GC queue. Enqueues beyond this are dropped
/// with a warning rather than blocking the caller.
pub const GC_QUEUE_CAPACITY: usize = 10 * 1024;

/// A deferred removal: the worker re-checks the key once the due time
/// passes, so marking an absent key is harmless.
#[derive(Clone, Debug)]
pub struct GcTask {
    /// Key to remove
    pub key: String,
    /// When the removal becomes due
    pub due: Instant,
}

impl GcTask {
    /// Schedule removal of `key` after `delay`
    #[must_use]
    pub fn new(key: String, delay: Duration) -> Self {
        Self {
            key,
            due: Instant::now() + delay,
        }
    }

    /// Check whether the task was due at `now`
    #[must_use]
    pub fn is_ready_at(&self, now: Instant) -> bool {
        now >= self.due
    }
}

// Ordered by due time so the worker's heap visits aged tasks first.
impl PartialEq for GcTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.key == other.key
    }
}

impl Eq for GcTask {}

impl PartialOrd for GcTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then_with(|| self.key.cmp(&other.key))
    }
}
