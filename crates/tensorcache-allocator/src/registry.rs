//! Mount table of live segment allocators.
//!
//! The registry map sits behind a readers-writer lock: mount/unmount take
//! exclusive access, everything else reads. Callers that also need shard
//! or allocator locks first take a [`snapshot`](SegmentRegistry::snapshot)
//! and drop the registry lock, so the registry lock never nests with any
//! other lock in the system.

use crate::buffer::{BufHandle, BufferAllocator};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tensorcache_common::{Error, Result};
use tracing::debug;

/// Point-in-time view of the mounted allocators
pub type AllocatorView = HashMap<String, Arc<BufferAllocator>>;

/// Registry of per-segment buffer allocators, keyed by segment name
#[derive(Default)]
pub struct SegmentRegistry {
    allocators: RwLock<AllocatorView>,
}

impl SegmentRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment and build its allocator.
    ///
    /// Fails with `InvalidParams` if the name is empty, the size is zero,
    /// or a segment with this name is already mounted.
    pub fn add_segment(&self, segment_name: &str, base: u64, size: u64) -> Result<()> {
        if segment_name.is_empty() {
            return Err(Error::invalid_params("segment name must not be empty"));
        }
        if size == 0 {
            return Err(Error::invalid_params(format!(
                "segment {segment_name} has zero size"
            )));
        }
        let mut allocators = self.allocators.write();
        if allocators.contains_key(segment_name) {
            return Err(Error::invalid_params(format!(
                "segment {segment_name} is already mounted"
            )));
        }
        let allocator = Arc::new(BufferAllocator::new(segment_name, base, size));
        debug!(
            segment = segment_name,
            id = %allocator.segment_id(),
            size,
            "registered segment allocator"
        );
        allocators.insert(segment_name.to_string(), allocator);
        Ok(())
    }

    /// Drop a segment's allocator.
    ///
    /// Handles already issued from it stay in object metadata but become
    /// stale; the metadata accessor reconciles them lazily.
    pub fn remove_segment(&self, segment_name: &str) -> Result<()> {
        let mut allocators = self.allocators.write();
        match allocators.remove(segment_name) {
            Some(allocator) => {
                debug!(
                    segment = segment_name,
                    id = %allocator.segment_id(),
                    "dropped segment allocator"
                );
                Ok(())
            }
            None => Err(Error::invalid_params(format!(
                "segment {segment_name} is not mounted"
            ))),
        }
    }

    /// Clone the live allocator map under the read lock
    #[must_use]
    pub fn snapshot(&self) -> AllocatorView {
        self.allocators.read().clone()
    }

    /// Check whether a segment is currently mounted
    #[must_use]
    pub fn contains(&self, segment_name: &str) -> bool {
        self.allocators.read().contains_key(segment_name)
    }

    /// Names of all mounted segments
    #[must_use]
    pub fn segment_names(&self) -> Vec<String> {
        self.allocators.read().keys().cloned().collect()
    }

    /// Used and total capacity of one segment, in bytes
    #[must_use]
    pub fn query(&self, segment_name: &str) -> Option<(u64, u64)> {
        self.allocators
            .read()
            .get(segment_name)
            .map(|a| (a.used(), a.capacity()))
    }

    /// Number of mounted segments
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocators.read().len()
    }

    /// Check if no segments are mounted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocators.read().is_empty()
    }
}

/// Release a handle against a view.
///
/// Returns `false` when the handle is stale for this view: the segment is
/// gone or was re-mounted under a new id. Stale releases are no-ops; the
/// memory died with the old allocator.
pub fn release_handle(view: &AllocatorView, handle: &BufHandle) -> bool {
    match view.get(&handle.segment_name) {
        Some(allocator) if allocator.segment_id() == handle.segment_id => {
            allocator.free(handle);
            true
        }
        _ => false,
    }
}

/// Aggregate `(used, capacity)` bytes across a view
#[must_use]
pub fn total_usage(view: &AllocatorView) -> (u64, u64) {
    view.values()
        .fold((0, 0), |(used, cap), a| (used + a.used(), cap + a.capacity()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_segment() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1 << 20).unwrap();
        assert!(registry.contains("n1:7000"));
        assert_eq!(registry.len(), 1);

        registry.remove_segment("n1:7000").unwrap();
        assert!(!registry.contains("n1:7000"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_mount_rejected() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1 << 20).unwrap();
        assert!(registry.add_segment("n1:7000", 0, 1 << 20).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        let registry = SegmentRegistry::new();
        assert!(registry.add_segment("n1:7000", 0, 0).is_err());
        assert!(registry.add_segment("", 0, 1024).is_err());
    }

    #[test]
    fn test_unmount_absent_rejected() {
        let registry = SegmentRegistry::new();
        assert!(registry.remove_segment("ghost").is_err());
    }

    #[test]
    fn test_query() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1024).unwrap();
        let view = registry.snapshot();
        let handle = view["n1:7000"].allocate(100).unwrap();
        assert_eq!(registry.query("n1:7000"), Some((100, 1024)));
        assert_eq!(registry.query("ghost"), None);
        release_handle(&view, &handle);
        assert_eq!(registry.query("n1:7000"), Some((0, 1024)));
    }

    #[test]
    fn test_release_after_unmount_is_noop() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1024).unwrap();
        let view = registry.snapshot();
        let handle = view["n1:7000"].allocate(100).unwrap();

        registry.remove_segment("n1:7000").unwrap();
        let fresh = registry.snapshot();
        assert!(!release_handle(&fresh, &handle));
    }

    #[test]
    fn test_release_after_remount_is_noop() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1024).unwrap();
        let handle = registry.snapshot()["n1:7000"].allocate(100).unwrap();

        registry.remove_segment("n1:7000").unwrap();
        registry.add_segment("n1:7000", 0, 1024).unwrap();

        // Same name, new mount generation: the stale handle must not free
        // anything on the new allocator.
        let view = registry.snapshot();
        assert!(!release_handle(&view, &handle));
        assert_eq!(registry.query("n1:7000"), Some((0, 1024)));
    }

    #[test]
    fn test_total_usage() {
        let registry = SegmentRegistry::new();
        registry.add_segment("n1:7000", 0, 1024).unwrap();
        registry.add_segment("n2:7000", 0, 2048).unwrap();
        let view = registry.snapshot();
        view["n1:7000"].allocate(512).unwrap();
        assert_eq!(total_usage(&view), (512, 3072));
    }
}
