//! Pluggable placement policies for the tensorcache master.
//!
//! Two strategy seams are consumed by the master core:
//! - [`AllocationStrategy`]: which segment a replica slice is drawn from
//! - [`EvictionStrategy`]: which expired objects to evict under pressure
//!
//! Both operate on snapshots handed in by the master and keep no reference
//! to master internals.

pub mod allocation;
pub mod eviction;

pub use allocation::{AllocationStrategy, RandomAllocation};
pub use eviction::{EvictionCandidate, EvictionStrategy, LruEviction};
