//! Segment selection for replica slices.

use rand::Rng;
use std::sync::Arc;
use tensorcache_allocator::{AllocatorView, BufferAllocator};
use tensorcache_common::ReplicateConfig;

/// Picks the segment a slice allocation is drawn from.
///
/// The strategy only chooses; the master performs the actual allocation
/// and handles the failure path. Implementations must not retain the view
/// or reach back into master state.
pub trait AllocationStrategy: Send + Sync {
    /// Select an allocator able to hold `size` bytes, or `None` when no
    /// mounted segment qualifies.
    fn select(
        &self,
        view: &AllocatorView,
        size: u64,
        config: &ReplicateConfig,
    ) -> Option<Arc<BufferAllocator>>;
}

/// Uniform random selection among segments with enough free space.
///
/// A preferred segment in the replicate config is tried first and wins
/// whenever it can hold the slice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomAllocation;

impl AllocationStrategy for RandomAllocation {
    fn select(
        &self,
        view: &AllocatorView,
        size: u64,
        config: &ReplicateConfig,
    ) -> Option<Arc<BufferAllocator>> {
        if let Some(preferred) = &config.preferred_segment {
            if let Some(allocator) = view.get(preferred) {
                if allocator.available() >= size {
                    return Some(Arc::clone(allocator));
                }
            }
        }

        let eligible: Vec<&Arc<BufferAllocator>> =
            view.values().filter(|a| a.available() >= size).collect();
        if eligible.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        Some(Arc::clone(eligible[rng.gen_range(0..eligible.len())]))
    }
}
