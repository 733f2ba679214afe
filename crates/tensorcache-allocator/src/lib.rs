//! Buffer allocation for the tensorcache master.
//!
//! This crate provides:
//! - [`BufferAllocator`]: per-segment sub-allocator handing out byte ranges
//! - [`BufHandle`]: an allocated range, the unit clients transfer against
//! - [`SegmentRegistry`]: the mount table of live allocators
//!
//! The master owns the handles it stores in object metadata; freeing goes
//! through an [`AllocatorView`] snapshot so no registry lock is held while
//! other locks are taken.

pub mod buffer;
pub mod registry;

pub use buffer::{BufHandle, BufferAllocator, Extent};
pub use registry::{release_handle, total_usage, AllocatorView, SegmentRegistry};
