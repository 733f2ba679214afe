//! Control-plane master for the tensorcache distributed object cache.
//!
//! The master owns authoritative metadata only: which keys exist, where
//! their replicas' slices live inside mounted segments, and under what
//! lease. Object bytes never pass through it; clients transfer data
//! directly against the buffer handles this crate allocates.
//!
//! Core pieces:
//! - sharded key → metadata index with per-shard locking ([`metadata`])
//! - put/commit/revoke state machine with exclusive-writer semantics
//! - lease-based read protection
//! - deferred GC via a delay queue and watermark-driven eviction ([`gc`],
//!   the background worker in [`service`])
//!
//! The RPC surface, data plane, and process bootstrap live outside this
//! crate; [`MasterService`] is the embedding point.

pub mod gc;
pub mod metadata;
pub mod service;

pub use metadata::{MetadataAccessor, ObjectMetadata, Replica, NUM_SHARDS};
pub use service::{MasterService, MasterStats};
