//! Sharded object metadata and the scoped accessor.
//!
//! Keys hash into one of [`NUM_SHARDS`] independently locked maps. All
//! reads and writes of an entry go through [`MetadataAccessor`], which
//! holds the shard lock for its whole scope and reconciles stale handles
//! on entry, so every operation sees the same lock-and-cleanup discipline
//! without a global lock.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tensorcache_allocator::{release_handle, AllocatorView, BufHandle};
use tensorcache_common::{HandleStatus, ReplicaDescriptor, ReplicaStatus};

/// Number of metadata shards. Keys map to shards by stable hash; the
/// index for a key never changes over the key's lifetime.
pub const NUM_SHARDS: usize = 1024;

/// Shard index for a key
#[must_use]
pub fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % NUM_SHARDS as u64) as usize
}

/// One full copy of an object: an ordered sequence of handles tiling the
/// object, one handle per slice.
#[derive(Clone, Debug)]
pub struct Replica {
    handles: Vec<BufHandle>,
    status: ReplicaStatus,
}

impl Replica {
    /// Create a replica in `Processing` state from freshly allocated
    /// handles
    #[must_use]
    pub fn new(handles: Vec<BufHandle>) -> Self {
        Self {
            handles,
            status: ReplicaStatus::Processing,
        }
    }

    /// Replica status
    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    /// Handles in object order
    #[must_use]
    pub fn handles(&self) -> &[BufHandle] {
        &self.handles
    }

    /// Commit the replica: the writer finished all slices
    pub fn mark_complete(&mut self) {
        self.status = ReplicaStatus::Complete;
        for handle in &mut self.handles {
            handle.status = HandleStatus::Complete;
        }
    }

    /// Snapshot as a client-facing descriptor
    #[must_use]
    pub fn descriptor(&self) -> ReplicaDescriptor {
        ReplicaDescriptor {
            status: self.status,
            handles: self.handles.iter().map(BufHandle::descriptor).collect(),
        }
    }
}

/// Authoritative metadata for one object
#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    /// Replicas, length equals the requested replica count
    pub replicas: Vec<Replica>,
    /// Total byte length of the object
    pub size: u64,
    /// Read-protection deadline. Initialized to creation time, which is
    /// already expired by the time anyone checks.
    lease_deadline: Instant,
}

impl ObjectMetadata {
    /// Create metadata with an expired lease
    #[must_use]
    pub fn new(size: u64, replicas: Vec<Replica>) -> Self {
        Self {
            replicas,
            size,
            lease_deadline: Instant::now(),
        }
    }

    /// Extend the lease to `now + ttl`. Never shortens an existing lease.
    pub fn grant_lease(&mut self, ttl: Duration) {
        self.lease_deadline = self.lease_deadline.max(Instant::now() + ttl);
    }

    /// Current lease deadline
    #[must_use]
    pub fn lease_deadline(&self) -> Instant {
        self.lease_deadline
    }

    /// Check whether the lease had expired at `now`
    #[must_use]
    pub fn is_lease_expired_at(&self, now: Instant) -> bool {
        now >= self.lease_deadline
    }

    /// Check whether the lease has expired
    #[must_use]
    pub fn is_lease_expired(&self) -> bool {
        self.is_lease_expired_at(Instant::now())
    }

    /// Return the status of the first replica whose status differs from
    /// `expected`, or `None` when all replicas match.
    #[must_use]
    pub fn has_diff_rep_status(&self, expected: ReplicaStatus) -> Option<ReplicaStatus> {
        self.replicas
            .iter()
            .map(Replica::status)
            .find(|&status| status != expected)
    }

    /// True when any handle references a segment that is absent from the
    /// view or was re-mounted under a new id. One stale handle makes the
    /// whole entry unrecoverable.
    pub(crate) fn has_stale_handle(&self, view: &AllocatorView) -> bool {
        self.replicas.iter().flat_map(Replica::handles).any(|h| {
            view.get(&h.segment_name)
                .map_or(true, |a| a.segment_id() != h.segment_id)
        })
    }

    /// Release every handle still live in `view`. Stale handles are
    /// skipped; their memory died with the unmounted allocator.
    pub(crate) fn release_handles(&self, view: &AllocatorView) {
        for replica in &self.replicas {
            for handle in replica.handles() {
                release_handle(view, handle);
            }
        }
    }
}

/// One lockable metadata partition
#[derive(Default)]
pub struct MetadataShard {
    pub(crate) entries: Mutex<HashMap<String, ObjectMetadata>>,
}

/// Scoped accessor for one key's metadata.
///
/// Construction locks the key's shard and performs stale-handle cleanup;
/// the lock is held until the accessor is dropped, so the caller has
/// exclusive access to the key for the accessor's whole scope.
pub struct MetadataAccessor<'a> {
    key: &'a str,
    view: &'a AllocatorView,
    guard: MutexGuard<'a, HashMap<String, ObjectMetadata>>,
}

impl<'a> MetadataAccessor<'a> {
    /// Lock `shard` and reconcile the entry for `key` against `view`.
    ///
    /// The view must be snapshotted before this call; no registry lock is
    /// taken while the shard lock is held.
    pub fn new(shard: &'a MetadataShard, view: &'a AllocatorView, key: &'a str) -> Self {
        let mut guard = shard.entries.lock();
        let is_stale = guard.get(key).is_some_and(|meta| meta.has_stale_handle(view));
        if is_stale {
            if let Some(meta) = guard.remove(key) {
                meta.release_handles(view);
            }
        }
        Self { key, view, guard }
    }

    /// Check whether the entry survived cleanup
    #[must_use]
    pub fn exists(&self) -> bool {
        self.guard.contains_key(self.key)
    }

    /// Read the entry
    #[must_use]
    pub fn get(&self) -> Option<&ObjectMetadata> {
        self.guard.get(self.key)
    }

    /// Mutate the entry
    pub fn get_mut(&mut self) -> Option<&mut ObjectMetadata> {
        self.guard.get_mut(self.key)
    }

    /// Insert fresh metadata for the key. Only valid when `exists()` is
    /// false.
    pub fn create(&mut self, metadata: ObjectMetadata) -> &mut ObjectMetadata {
        self.guard.entry(self.key.to_string()).or_insert(metadata)
    }

    /// Erase the entry and release its live handles. Returns whether an
    /// entry was present.
    pub fn erase(&mut self) -> bool {
        match self.guard.remove(self.key) {
            Some(meta) => {
                meta.release_handles(self.view);
                true
            }
            None => false,
        }
    }
}
