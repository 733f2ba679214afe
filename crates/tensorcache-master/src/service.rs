//! Master service façade and the GC/eviction worker.
//!
//! [`MasterService`] threads every public operation through the segment
//! registry, the metadata shards, and the placement strategies. One
//! background thread drains the delayed-GC queue and runs watermark
//! eviction sweeps; it is signalled and joined when the service drops.

use crate::gc::{GcTask, GC_QUEUE_CAPACITY};
use crate::metadata::{
    shard_index, MetadataAccessor, MetadataShard, ObjectMetadata, Replica, NUM_SHARDS,
};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tensorcache_allocator::{release_handle, total_usage, AllocatorView, SegmentRegistry};
use tensorcache_common::{
    Error, MasterConfig, ReplicaDescriptor, ReplicaStatus, ReplicateConfig, Result,
};
use tensorcache_placement::{
    AllocationStrategy, EvictionCandidate, EvictionStrategy, LruEviction, RandomAllocation,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker sleep between GC and eviction checks
const GC_WORKER_SLEEP: Duration = Duration::from_millis(10);

/// Largest slice a put may request
pub const MAX_SLICE_SIZE: u64 = 64 * 1024 * 1024;

/// Aggregate usage snapshot for the scheduling layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MasterStats {
    /// Keys across all shards
    pub key_count: usize,
    /// Mounted segments
    pub segment_count: usize,
    /// Allocated bytes across all segments
    pub used_bytes: u64,
    /// Total bytes across all segments
    pub capacity_bytes: u64,
}

/// State shared between caller threads and the GC worker
struct MasterState {
    config: MasterConfig,
    registry: SegmentRegistry,
    shards: Vec<MetadataShard>,
    allocation: Box<dyn AllocationStrategy>,
    eviction: Box<dyn EvictionStrategy>,
    gc_queue: ArrayQueue<GcTask>,
    gc_running: AtomicBool,
    need_eviction: AtomicBool,
    session_id: String,
}

impl MasterState {
    fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.config.default_kv_lease_ttl_ms)
    }

    fn access<'a>(&'a self, view: &'a AllocatorView, key: &'a str) -> MetadataAccessor<'a> {
        MetadataAccessor::new(&self.shards[shard_index(key)], view, key)
    }

    fn exist_key(&self, key: &str) -> Result<()> {
        let view = self.registry.snapshot();
        let ttl = self.lease_ttl();
        let mut acc = self.access(&view, key);
        match acc.get_mut() {
            Some(meta) => {
                meta.grant_lease(ttl);
                Ok(())
            }
            None => Err(Error::ObjectNotFound(key.to_string())),
        }
    }

    fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        let view = self.registry.snapshot();
        let ttl = self.lease_ttl();
        let mut acc = self.access(&view, key);
        let Some(meta) = acc.get_mut() else {
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        let descriptors: Vec<ReplicaDescriptor> = meta
            .replicas
            .iter()
            .filter(|r| r.status() == ReplicaStatus::Complete)
            .map(Replica::descriptor)
            .collect();
        if descriptors.is_empty() {
            return Err(Error::ReplicaNotReady(key.to_string()));
        }
        meta.grant_lease(ttl);
        Ok(descriptors)
    }

    fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        if value_length == 0 {
            return Err(Error::invalid_params("value length must be non-zero"));
        }
        if slice_lengths.is_empty() {
            return Err(Error::invalid_params("at least one slice is required"));
        }
        if config.replica_num == 0 {
            return Err(Error::invalid_params("replica count must be non-zero"));
        }
        let mut total = 0u64;
        for &length in slice_lengths {
            if length == 0 {
                return Err(Error::invalid_params("slice length must be non-zero"));
            }
            if length > MAX_SLICE_SIZE {
                return Err(Error::invalid_params(format!(
                    "slice length {length} exceeds maximum {MAX_SLICE_SIZE}"
                )));
            }
            total += length;
        }
        if total != value_length {
            return Err(Error::invalid_params(format!(
                "slice lengths sum to {total}, expected {value_length}"
            )));
        }

        let view = self.registry.snapshot();
        let mut acc = self.access(&view, key);
        if acc.exists() {
            return Err(Error::ObjectAlreadyExists(key.to_string()));
        }

        // Allocate every slice of every replica up front; on any failure
        // all handles acquired for this request go back before returning,
        // leaving the keyspace and allocators unchanged.
        let mut replicas: Vec<Replica> = Vec::with_capacity(config.replica_num);
        for _ in 0..config.replica_num {
            let mut handles = Vec::with_capacity(slice_lengths.len());
            for &length in slice_lengths {
                let allocated = self
                    .allocation
                    .select(&view, length, config)
                    .and_then(|allocator| allocator.allocate(length));
                match allocated {
                    Some(handle) => handles.push(handle),
                    None => {
                        for handle in handles
                            .iter()
                            .chain(replicas.iter().flat_map(|r| r.handles().iter()))
                        {
                            release_handle(&view, handle);
                        }
                        self.need_eviction.store(true, Ordering::Relaxed);
                        warn!(key, requested = length, "slice allocation failed");
                        return Err(Error::NoAvailableHandle { requested: length });
                    }
                }
            }
            replicas.push(Replica::new(handles));
        }

        let descriptors: Vec<ReplicaDescriptor> =
            replicas.iter().map(Replica::descriptor).collect();
        acc.create(ObjectMetadata::new(value_length, replicas));

        let (used, capacity) = total_usage(&view);
        if capacity > 0
            && used as f64 >= self.config.eviction_high_watermark_ratio * capacity as f64
        {
            self.need_eviction.store(true, Ordering::Relaxed);
        }
        Ok(descriptors)
    }

    fn put_end(&self, key: &str) -> Result<()> {
        let view = self.registry.snapshot();
        let mut acc = self.access(&view, key);
        let Some(meta) = acc.get_mut() else {
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if let Some(status) = meta.has_diff_rep_status(ReplicaStatus::Processing) {
            return Err(Error::InvalidWrite {
                key: key.to_string(),
                status,
            });
        }
        for replica in &mut meta.replicas {
            replica.mark_complete();
        }
        Ok(())
    }

    fn put_revoke(&self, key: &str) -> Result<()> {
        let view = self.registry.snapshot();
        let mut acc = self.access(&view, key);
        let Some(meta) = acc.get() else {
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if let Some(status) = meta.has_diff_rep_status(ReplicaStatus::Processing) {
            return Err(Error::InvalidWrite {
                key: key.to_string(),
                status,
            });
        }
        acc.erase();
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let view = self.registry.snapshot();
        let mut acc = self.access(&view, key);
        let Some(meta) = acc.get() else {
            return Err(Error::ObjectNotFound(key.to_string()));
        };
        if !meta.is_lease_expired() {
            return Err(Error::ObjectHasLease(key.to_string()));
        }
        acc.erase();
        Ok(())
    }

    fn remove_all(&self) -> usize {
        let view = self.registry.snapshot();
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, meta)| meta.is_lease_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(meta) = entries.remove(&key) {
                    meta.release_handles(&view);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// One eviction sweep: walk the shards, offer expired fully-complete
    /// entries to the strategy, erase its victims until the byte target
    /// is met, then lower the pressure flag.
    fn batch_evict(&self, eviction_ratio: f64) {
        let view = self.registry.snapshot();
        let (used, capacity) = total_usage(&view);
        let target = ((capacity as f64 * eviction_ratio) as u64).min(used);
        if target == 0 {
            self.need_eviction.store(false, Ordering::Relaxed);
            return;
        }

        let now = Instant::now();
        let mut freed = 0u64;
        let mut evicted = 0usize;
        for shard in &self.shards {
            if freed >= target {
                break;
            }
            let mut entries = shard.entries.lock();
            let candidates: Vec<EvictionCandidate> = entries
                .iter()
                .filter(|(_, meta)| {
                    meta.is_lease_expired_at(now)
                        && meta.has_diff_rep_status(ReplicaStatus::Complete).is_none()
                })
                .map(|(key, meta)| EvictionCandidate {
                    key: key.clone(),
                    size: meta.size,
                    lease_deadline: meta.lease_deadline(),
                })
                .collect();
            for key in self.eviction.select_victims(&candidates, target - freed) {
                if let Some(meta) = entries.remove(&key) {
                    freed += meta.size;
                    evicted += 1;
                    meta.release_handles(&view);
                }
            }
        }
        self.need_eviction.store(false, Ordering::Relaxed);
        if evicted > 0 {
            debug!(evicted, freed, target, "eviction sweep complete");
        }
    }
}

/// GC and eviction worker loop. Exits within one sleep interval of
/// `gc_running` dropping; tasks still pending at shutdown are discarded.
fn gc_loop(state: Arc<MasterState>) {
    info!("gc worker started");
    let mut pending: BinaryHeap<Reverse<GcTask>> = BinaryHeap::new();
    while state.gc_running.load(Ordering::Relaxed) {
        if state.config.enable_gc {
            while let Some(task) = state.gc_queue.pop() {
                pending.push(Reverse(task));
            }
            let now = Instant::now();
            while pending.peek().map_or(false, |r| r.0.is_ready_at(now)) {
                if let Some(Reverse(task)) = pending.pop() {
                    match state.remove(&task.key) {
                        Ok(()) => debug!(key = task.key.as_str(), "garbage collected"),
                        Err(e) => debug!(key = task.key.as_str(), error = %e, "gc skipped key"),
                    }
                }
            }
        }
        if state.need_eviction.load(Ordering::Relaxed) {
            state.batch_evict(state.config.eviction_ratio);
        }
        thread::sleep(GC_WORKER_SLEEP);
    }
    info!("gc worker stopped");
}

/// The control-plane master.
///
/// Owns the authoritative key → metadata index and arbitrates allocation,
/// replication, lifetime, and eviction over the mounted segments. All
/// methods are safe to call from any thread concurrently; operations on
/// the same key serialize on that key's shard lock.
pub struct MasterService {
    state: Arc<MasterState>,
    gc_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MasterService {
    /// Create a master with the default strategies (random allocation,
    /// least-recently-leased eviction) and start the background worker.
    pub fn new(config: MasterConfig) -> Result<Self> {
        Self::with_strategies(config, Box::new(RandomAllocation), Box::new(LruEviction))
    }

    /// Create a master with caller-provided placement strategies.
    pub fn with_strategies(
        config: MasterConfig,
        allocation: Box<dyn AllocationStrategy>,
        eviction: Box<dyn EvictionStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(MasterState {
            config,
            registry: SegmentRegistry::new(),
            shards: (0..NUM_SHARDS).map(|_| MetadataShard::default()).collect(),
            allocation,
            eviction,
            gc_queue: ArrayQueue::new(GC_QUEUE_CAPACITY),
            gc_running: AtomicBool::new(true),
            need_eviction: AtomicBool::new(false),
            session_id: Uuid::new_v4().to_string(),
        });
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("tensorcache-gc".into())
            .spawn(move || gc_loop(worker_state))
            .map_err(|e| Error::internal(format!("failed to spawn gc worker: {e}")))?;
        info!(session = %state.session_id, "master service started");
        Ok(Self {
            state,
            gc_thread: Mutex::new(Some(handle)),
        })
    }

    /// Mount a segment of `size` bytes at `base`, making it available for
    /// allocation. Fails with `InvalidParams` when the name is taken or
    /// the size is zero.
    pub fn mount_segment(&self, segment_name: &str, base: u64, size: u64) -> Result<()> {
        self.state.registry.add_segment(segment_name, base, size)?;
        info!(segment = segment_name, base, size, "mounted segment");
        Ok(())
    }

    /// Unmount a segment. Handles issued from it become stale and are
    /// reconciled lazily on the next access of each affected key.
    pub fn unmount_segment(&self, segment_name: &str) -> Result<()> {
        self.state.registry.remove_segment(segment_name)?;
        info!(segment = segment_name, "unmounted segment");
        Ok(())
    }

    /// Check whether a key exists. Grants the default lease on success.
    pub fn exist_key(&self, key: &str) -> Result<()> {
        self.state.exist_key(key)
    }

    /// Descriptors of every complete replica of `key`. Grants the default
    /// lease on success; `ReplicaNotReady` when the entry exists but no
    /// replica is complete yet.
    pub fn get_replica_list(&self, key: &str) -> Result<Vec<ReplicaDescriptor>> {
        self.state.get_replica_list(key)
    }

    /// Per-key [`get_replica_list`](Self::get_replica_list); the returned
    /// map holds entries only for the keys that succeeded.
    pub fn batch_get_replica_list(
        &self,
        keys: &[String],
    ) -> HashMap<String, Vec<ReplicaDescriptor>> {
        let mut out = HashMap::new();
        for key in keys {
            if let Ok(descriptors) = self.state.get_replica_list(key) {
                out.insert(key.clone(), descriptors);
            }
        }
        out
    }

    /// Begin a put: allocate `config.replica_num` replicas, each tiling
    /// `value_length` bytes across one handle per slice, and create the
    /// entry with all replicas in `Processing`. The caller writes the
    /// bytes and then calls [`put_end`](Self::put_end) or
    /// [`put_revoke`](Self::put_revoke).
    pub fn put_start(
        &self,
        key: &str,
        value_length: u64,
        slice_lengths: &[u64],
        config: &ReplicateConfig,
    ) -> Result<Vec<ReplicaDescriptor>> {
        self.state.put_start(key, value_length, slice_lengths, config)
    }

    /// Commit a put: every replica moves `Processing` → `Complete`.
    pub fn put_end(&self, key: &str) -> Result<()> {
        self.state.put_end(key)
    }

    /// Abort a put: the entry is erased and its allocations released.
    pub fn put_revoke(&self, key: &str) -> Result<()> {
        self.state.put_revoke(key)
    }

    /// Start puts for a batch of keys. Keys are processed independently;
    /// on the first failure the successfully started keys are revoked and
    /// that error is returned.
    pub fn batch_put_start(
        &self,
        keys: &[String],
        value_lengths: &HashMap<String, u64>,
        slice_lengths: &HashMap<String, Vec<u64>>,
        config: &ReplicateConfig,
    ) -> Result<HashMap<String, Vec<ReplicaDescriptor>>> {
        let mut out: HashMap<String, Vec<ReplicaDescriptor>> = HashMap::new();
        for key in keys {
            let started = match (value_lengths.get(key), slice_lengths.get(key)) {
                (Some(&length), Some(slices)) => self.state.put_start(key, length, slices, config),
                _ => Err(Error::invalid_params(format!(
                    "no lengths supplied for key {key}"
                ))),
            };
            match started {
                Ok(descriptors) => {
                    out.insert(key.clone(), descriptors);
                }
                Err(e) => {
                    for started_key in out.keys() {
                        if let Err(revoke_err) = self.state.put_revoke(started_key) {
                            warn!(key = started_key.as_str(), error = %revoke_err,
                                "failed to revoke after batch put failure");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Commit a batch of puts, best effort. Returns the per-key failures;
    /// an empty map means every key committed.
    pub fn batch_put_end(&self, keys: &[String]) -> HashMap<String, Error> {
        let mut failures = HashMap::new();
        for key in keys {
            if let Err(e) = self.state.put_end(key) {
                failures.insert(key.clone(), e);
            }
        }
        failures
    }

    /// Revoke a batch of puts, best effort. Returns the per-key failures.
    pub fn batch_put_revoke(&self, keys: &[String]) -> HashMap<String, Error> {
        let mut failures = HashMap::new();
        for key in keys {
            if let Err(e) = self.state.put_revoke(key) {
                failures.insert(key.clone(), e);
            }
        }
        failures
    }

    /// Remove a key and release its allocations. Refused with
    /// `ObjectHasLease` while the key's lease is unexpired.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.state.remove(key)
    }

    /// Remove every key whose lease has expired. Returns the count
    /// removed.
    pub fn remove_all(&self) -> usize {
        self.state.remove_all()
    }

    /// Schedule removal of `key` after `delay_ms` milliseconds. Always
    /// succeeds; when the queue is full the task is dropped with a
    /// warning, and the worker re-checks existence at removal time
    /// anyway.
    pub fn mark_for_gc(&self, key: &str, delay_ms: u64) -> Result<()> {
        let task = GcTask::new(key.to_string(), Duration::from_millis(delay_ms));
        if self.state.gc_queue.push(task).is_err() {
            warn!(key, "gc queue full, dropping delayed removal");
        }
        Ok(())
    }

    /// Snapshot all keys across the shards. Best-effort consistency: keys
    /// changing mid-iteration may or may not appear.
    pub fn get_all_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in &self.state.shards {
            keys.extend(shard.entries.lock().keys().cloned());
        }
        keys
    }

    /// Total number of keys
    pub fn get_key_count(&self) -> usize {
        self.state
            .shards
            .iter()
            .map(|shard| shard.entries.lock().len())
            .sum()
    }

    /// Names of all mounted segments
    pub fn get_all_segments(&self) -> Vec<String> {
        self.state.registry.segment_names()
    }

    /// Used and total capacity of a segment, in bytes
    pub fn query_segments(&self, segment_name: &str) -> Result<(u64, u64)> {
        self.state.registry.query(segment_name).ok_or_else(|| {
            Error::invalid_params(format!("segment {segment_name} is not mounted"))
        })
    }

    /// Aggregate usage snapshot
    pub fn stats(&self) -> MasterStats {
        let view = self.state.registry.snapshot();
        let (used_bytes, capacity_bytes) = total_usage(&view);
        MasterStats {
            key_count: self.get_key_count(),
            segment_count: view.len(),
            used_bytes,
            capacity_bytes,
        }
    }

    /// Opaque per-process session identifier. A client seeing a new value
    /// knows the master restarted and its cached descriptors are void.
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }
}

impl Drop for MasterService {
    fn drop(&mut self) {
        self.state.gc_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorcache_common::HandleStatus;

    const MIB: u64 = 1024 * 1024;

    fn create_test_config() -> MasterConfig {
        MasterConfig {
            enable_gc: true,
            default_kv_lease_ttl_ms: 0,
            eviction_ratio: 1.0,
            eviction_high_watermark_ratio: 1.0,
        }
    }

    fn create_test_master() -> MasterService {
        MasterService::new(create_test_config()).unwrap()
    }

    fn create_master_with(config: MasterConfig) -> MasterService {
        MasterService::new(config).unwrap()
    }

    fn put_object(master: &MasterService, key: &str, size: u64) {
        master
            .put_start(key, size, &[size], &ReplicateConfig::single())
            .unwrap();
        master.put_end(key).unwrap();
    }

    // A sweep between put_start and put_end sees only a processing entry
    // and lowers the pressure flag; a throwaway put re-raises it once the
    // real entries are committed.
    fn raise_eviction_pressure(master: &MasterService) {
        master
            .put_start("_poke", 1, &[1], &ReplicateConfig::single())
            .unwrap();
        master.put_revoke("_poke").unwrap();
    }

    #[test]
    fn test_simple_put_get() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();

        let started = master
            .put_start("k", 1024, &[1024], &ReplicateConfig::single())
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].status, ReplicaStatus::Processing);
        assert_eq!(started[0].handles.len(), 1);
        assert_eq!(started[0].handles[0].size, 1024);
        assert_eq!(started[0].handles[0].status, HandleStatus::Init);

        master.put_end("k").unwrap();

        let replicas = master.get_replica_list("k").unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].status, ReplicaStatus::Complete);
        assert_eq!(replicas[0].handles.len(), 1);
        assert_eq!(replicas[0].handles[0].segment_name, "n1:7000");
        assert_eq!(replicas[0].handles[0].size, 1024);
        assert_eq!(replicas[0].handles[0].status, HandleStatus::Complete);
        // Committed descriptors address the same range put_start reserved
        assert_eq!(replicas[0].handles[0].offset, started[0].handles[0].offset);
    }

    #[test]
    fn test_put_existing_key_rejected() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();

        master
            .put_start("k", 1024, &[1024], &ReplicateConfig::single())
            .unwrap();
        assert!(matches!(
            master.put_start("k", 1024, &[1024], &ReplicateConfig::single()),
            Err(Error::ObjectAlreadyExists(_))
        ));

        master.put_end("k").unwrap();
        assert!(matches!(
            master.put_start("k", 1024, &[1024], &ReplicateConfig::single()),
            Err(Error::ObjectAlreadyExists(_))
        ));
    }

    #[test]
    fn test_revoke_then_reuse() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();

        master
            .put_start("x", 512, &[512], &ReplicateConfig::single())
            .unwrap();
        master.put_revoke("x").unwrap();
        assert!(matches!(
            master.exist_key("x"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.stats().used_bytes, 0);

        master
            .put_start("x", 512, &[512], &ReplicateConfig::single())
            .unwrap();
        assert_eq!(master.stats().used_bytes, 512);
    }

    #[test]
    fn test_stale_segment_erases_entry() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "y", 1024);

        master.unmount_segment("n1:7000").unwrap();
        assert!(matches!(
            master.exist_key("y"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.get_key_count(), 0);
    }

    #[test]
    fn test_lease_protects_remove() {
        let master = create_master_with(MasterConfig {
            default_kv_lease_ttl_ms: 100,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "z", 1024);

        master.exist_key("z").unwrap();
        assert!(matches!(master.remove("z"), Err(Error::ObjectHasLease(_))));

        thread::sleep(Duration::from_millis(250));
        master.remove("z").unwrap();
        assert!(matches!(
            master.exist_key("z"),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_gc_delay() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "w", 1024);

        master.mark_for_gc("w", 30).unwrap();
        master.exist_key("w").unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(matches!(
            master.exist_key("w"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.stats().used_bytes, 0);
    }

    #[test]
    fn test_gc_skips_leased_key() {
        let master = create_master_with(MasterConfig {
            default_kv_lease_ttl_ms: 60_000,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "w", 1024);

        master.exist_key("w").unwrap();
        master.mark_for_gc("w", 10).unwrap();
        thread::sleep(Duration::from_millis(200));
        master.exist_key("w").unwrap();
    }

    #[test]
    fn test_gc_disabled_leaves_queue_undrained() {
        let master = create_master_with(MasterConfig {
            enable_gc: false,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "w", 1024);

        master.mark_for_gc("w", 10).unwrap();
        thread::sleep(Duration::from_millis(200));
        master.exist_key("w").unwrap();
    }

    #[test]
    fn test_mark_for_gc_absent_key_ok() {
        let master = create_test_master();
        master.mark_for_gc("ghost", 1).unwrap();
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_put_end_state_machine() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();

        assert!(matches!(
            master.put_end("missing"),
            Err(Error::ObjectNotFound(_))
        ));
        assert!(matches!(
            master.put_revoke("missing"),
            Err(Error::ObjectNotFound(_))
        ));

        put_object(&master, "k", 1024);
        assert!(matches!(
            master.put_end("k"),
            Err(Error::InvalidWrite {
                status: ReplicaStatus::Complete,
                ..
            })
        ));
        assert!(matches!(
            master.put_revoke("k"),
            Err(Error::InvalidWrite { .. })
        ));
    }

    #[test]
    fn test_get_before_commit_not_ready() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        master
            .put_start("k", 1024, &[1024], &ReplicateConfig::single())
            .unwrap();
        assert!(matches!(
            master.get_replica_list("k"),
            Err(Error::ReplicaNotReady(_))
        ));
    }

    #[test]
    fn test_put_start_validation() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        let config = ReplicateConfig::single();

        assert!(matches!(
            master.put_start("k", 0, &[], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 10, &[], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 10, &[0, 10], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 10, &[4, 4], &config),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start("k", 10, &[10], &ReplicateConfig::with_replicas(0)),
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            master.put_start(
                "k",
                MAX_SLICE_SIZE + 1,
                &[MAX_SLICE_SIZE + 1],
                &config
            ),
            Err(Error::InvalidParams(_))
        ));
        // Nothing leaked and the keyspace is untouched
        assert_eq!(master.get_key_count(), 0);
        assert_eq!(master.stats().used_bytes, 0);
    }

    #[test]
    fn test_no_available_handle() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 1024).unwrap();

        assert!(matches!(
            master.put_start("big", 4096, &[4096], &ReplicateConfig::single()),
            Err(Error::NoAvailableHandle { requested: 4096 })
        ));
        assert!(matches!(
            master.exist_key("big"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.stats().used_bytes, 0);

        // Capacity is still usable for a request that fits
        master
            .put_start("small", 512, &[512], &ReplicateConfig::single())
            .unwrap();
    }

    #[test]
    fn test_partial_allocation_released_on_failure() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 1024).unwrap();

        // First two slices fit, the third cannot; everything rolls back
        assert!(matches!(
            master.put_start("k", 1536, &[512, 512, 512], &ReplicateConfig::single()),
            Err(Error::NoAvailableHandle { requested: 512 })
        ));
        assert_eq!(master.stats().used_bytes, 0);
        assert_eq!(master.get_key_count(), 0);
    }

    #[test]
    fn test_multi_replica_allocation() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 4096).unwrap();
        master.mount_segment("n2:7000", 0, 4096).unwrap();

        let config = ReplicateConfig::with_replicas(2);
        let replicas = master.put_start("k", 1024, &[1024], &config).unwrap();
        assert_eq!(replicas.len(), 2);
        for replica in &replicas {
            assert_eq!(replica.handles.len(), 1);
            assert_eq!(replica.handles[0].size, 1024);
        }
        // Replica handles are independent allocations
        assert_eq!(master.stats().used_bytes, 2048);
    }

    #[test]
    fn test_preferred_segment_placement() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 4096).unwrap();
        master.mount_segment("n2:7000", 0, 4096).unwrap();

        let config = ReplicateConfig {
            replica_num: 1,
            preferred_segment: Some("n2:7000".into()),
        };
        let replicas = master.put_start("k", 1024, &[1024], &config).unwrap();
        assert_eq!(replicas[0].handles[0].segment_name, "n2:7000");
    }

    #[test]
    fn test_batch_put_roundtrip() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let value_lengths: HashMap<String, u64> =
            keys.iter().map(|k| (k.clone(), 1024)).collect();
        let slice_lengths: HashMap<String, Vec<u64>> =
            keys.iter().map(|k| (k.clone(), vec![1024])).collect();

        let started = master
            .batch_put_start(&keys, &value_lengths, &slice_lengths, &ReplicateConfig::single())
            .unwrap();
        assert_eq!(started.len(), 2);

        let failures = master.batch_put_end(&keys);
        assert!(failures.is_empty());

        let fetched = master.batch_get_replica_list(&keys);
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched["a"][0].status, ReplicaStatus::Complete);

        // Already-committed keys cannot be revoked
        let failures = master.batch_put_revoke(&keys);
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn test_batch_put_start_revokes_prefix_on_failure() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 1024).unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let value_lengths: HashMap<String, u64> =
            [("a".to_string(), 512), ("b".to_string(), 1024)].into();
        let slice_lengths: HashMap<String, Vec<u64>> =
            [("a".to_string(), vec![512]), ("b".to_string(), vec![1024])].into();

        assert!(matches!(
            master.batch_put_start(&keys, &value_lengths, &slice_lengths, &ReplicateConfig::single()),
            Err(Error::NoAvailableHandle { .. })
        ));
        // The successfully started prefix was revoked
        assert!(matches!(
            master.exist_key("a"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.stats().used_bytes, 0);
    }

    #[test]
    fn test_batch_put_end_reports_per_key() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        master
            .put_start("a", 1024, &[1024], &ReplicateConfig::single())
            .unwrap();

        let keys = vec!["a".to_string(), "ghost".to_string()];
        let failures = master.batch_put_end(&keys);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures["ghost"], Error::ObjectNotFound(_)));
        master.get_replica_list("a").unwrap();
    }

    #[test]
    fn test_batch_get_skips_unready_and_missing() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "done", 1024);
        master
            .put_start("pending", 1024, &[1024], &ReplicateConfig::single())
            .unwrap();

        let keys = vec![
            "done".to_string(),
            "pending".to_string(),
            "ghost".to_string(),
        ];
        let fetched = master.batch_get_replica_list(&keys);
        assert_eq!(fetched.len(), 1);
        assert!(fetched.contains_key("done"));
    }

    #[test]
    fn test_remove() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "k", 1024);

        master.remove("k").unwrap();
        assert!(matches!(master.remove("k"), Err(Error::ObjectNotFound(_))));
        assert_eq!(master.stats().used_bytes, 0);
    }

    #[test]
    fn test_remove_all_respects_leases() {
        let master = create_master_with(MasterConfig {
            default_kv_lease_ttl_ms: 60_000,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, MIB).unwrap();
        put_object(&master, "expired", 1024);
        put_object(&master, "leased", 1024);
        master.exist_key("leased").unwrap();

        assert_eq!(master.remove_all(), 1);
        assert_eq!(master.get_key_count(), 1);
        master.exist_key("leased").unwrap();
    }

    #[test]
    fn test_watermark_triggers_eviction() {
        let master = create_master_with(MasterConfig {
            eviction_high_watermark_ratio: 0.5,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, 1024).unwrap();
        put_object(&master, "k", 600);
        raise_eviction_pressure(&master);

        thread::sleep(Duration::from_millis(200));
        assert!(matches!(
            master.exist_key("k"),
            Err(Error::ObjectNotFound(_))
        ));
        assert_eq!(master.stats().used_bytes, 0);
    }

    #[test]
    fn test_eviction_skips_processing_replicas() {
        let master = create_master_with(MasterConfig {
            eviction_high_watermark_ratio: 0.0,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, 1024).unwrap();
        master
            .put_start("k", 600, &[600], &ReplicateConfig::single())
            .unwrap();

        thread::sleep(Duration::from_millis(150));
        assert_eq!(master.get_key_count(), 1);

        master.put_end("k").unwrap();
        raise_eviction_pressure(&master);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(master.get_key_count(), 0);
    }

    #[test]
    fn test_eviction_respects_leases() {
        let master = create_master_with(MasterConfig {
            default_kv_lease_ttl_ms: 60_000,
            eviction_high_watermark_ratio: 0.0,
            ..create_test_config()
        });
        master.mount_segment("n1:7000", 0, 1024).unwrap();
        put_object(&master, "k", 600);
        master.exist_key("k").unwrap();
        raise_eviction_pressure(&master);

        thread::sleep(Duration::from_millis(200));
        master.exist_key("k").unwrap();
    }

    #[test]
    fn test_key_and_segment_queries() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 1024).unwrap();
        master.mount_segment("n2:7000", 0, 2048).unwrap();
        put_object(&master, "k1", 256);
        put_object(&master, "k2", 256);

        let mut keys = master.get_all_keys();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(master.get_key_count(), 2);

        let mut segments = master.get_all_segments();
        segments.sort();
        assert_eq!(segments, vec!["n1:7000".to_string(), "n2:7000".to_string()]);

        let (_, capacity) = master.query_segments("n1:7000").unwrap();
        assert_eq!(capacity, 1024);
        assert!(matches!(
            master.query_segments("ghost"),
            Err(Error::InvalidParams(_))
        ));

        let stats = master.stats();
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.segment_count, 2);
        assert_eq!(stats.used_bytes, 512);
        assert_eq!(stats.capacity_bytes, 3072);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = create_test_master();
        let b = create_test_master();
        assert!(!a.session_id().is_empty());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MasterConfig {
            eviction_ratio: 2.0,
            ..MasterConfig::default()
        };
        assert!(MasterService::new(config).is_err());
    }

    #[test]
    fn test_concurrent_put_get_remove() {
        let master = create_test_master();
        master.mount_segment("n1:7000", 0, 4 * MIB).unwrap();

        thread::scope(|scope| {
            for t in 0..4 {
                let master = &master;
                scope.spawn(move || {
                    for i in 0..50 {
                        let key = format!("k{t}-{i}");
                        master
                            .put_start(&key, 1024, &[1024], &ReplicateConfig::single())
                            .unwrap();
                        master.put_end(&key).unwrap();
                        master.get_replica_list(&key).unwrap();
                        master.remove(&key).unwrap();
                    }
                });
            }
        });

        assert_eq!(master.get_key_count(), 0);
        assert_eq!(master.stats().used_bytes, 0);
    }
}
