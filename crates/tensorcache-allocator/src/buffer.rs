//! Per-segment buffer allocator.
//!
//! Each mounted segment gets one [`BufferAllocator`] that sub-allocates
//! byte ranges out of the segment's contributed region. The free space is
//! tracked as a sorted extent list with first-fit allocation and
//! coalescing on free.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tensorcache_common::{HandleDescriptor, HandleStatus, SegmentId};

/// A contiguous byte range, relative to the segment base
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Starting offset
    pub start: u64,
    /// Number of bytes in the extent
    pub length: u64,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Get the ending offset (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Try to merge with an adjacent extent
    #[must_use]
    pub fn try_merge(&self, other: &Extent) -> Option<Extent> {
        if self.end() == other.start {
            Some(Extent::new(self.start, self.length + other.length))
        } else if other.end() == self.start {
            Some(Extent::new(other.start, self.length + other.length))
        } else {
            None
        }
    }
}

/// A reserved byte range inside one mounted segment.
///
/// The master keeps handles inside object metadata; descriptors handed to
/// clients are copies ([`BufHandle::descriptor`]). A handle addresses its
/// allocator by `(segment_name, segment_id)` rather than by pointer, so an
/// unmounted allocator leaves the handle syntactically intact but stale.
#[derive(Clone, Debug)]
pub struct BufHandle {
    /// Name of the owning segment
    pub segment_name: String,
    /// Mount generation of the owning segment
    pub segment_id: SegmentId,
    /// Absolute byte offset inside the segment (base + relative offset)
    pub offset: u64,
    /// Length of the range in bytes
    pub size: u64,
    /// Handle status
    pub status: HandleStatus,
}

impl BufHandle {
    /// Snapshot this handle as a client-facing descriptor
    #[must_use]
    pub fn descriptor(&self) -> HandleDescriptor {
        HandleDescriptor {
            segment_name: self.segment_name.clone(),
            offset: self.offset,
            size: self.size,
            status: self.status,
        }
    }
}

/// First-fit extent allocator for one mounted segment.
///
/// Thread-safe: the free list sits behind a mutex and usage is tracked
/// with an atomic so capacity queries never take the lock. This lock is a
/// leaf; no other lock is acquired while holding it.
pub struct BufferAllocator {
    segment_name: String,
    segment_id: SegmentId,
    base: u64,
    capacity: u64,
    /// Free extents keyed by relative start offset
    free: Mutex<BTreeMap<u64, u64>>,
    used: AtomicU64,
}

impl BufferAllocator {
    /// Create an allocator covering `[base, base + capacity)` of a segment
    #[must_use]
    pub fn new(segment_name: impl Into<String>, base: u64, capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            segment_name: segment_name.into(),
            segment_id: SegmentId::new(),
            base,
            capacity,
            free: Mutex::new(free),
            used: AtomicU64::new(0),
        }
    }

    /// Name of the segment this allocator serves
    #[must_use]
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Mount generation of this allocator
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Base address of the segment region
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Currently allocated bytes
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes not currently allocated
    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity - self.used()
    }

    /// Reserve `size` bytes, first-fit.
    ///
    /// Returns `None` when no single free extent can hold the request;
    /// fragmented free space is not compacted.
    pub fn allocate(&self, size: u64) -> Option<BufHandle> {
        if size == 0 {
            return None;
        }
        let mut free = self.free.lock();
        let (start, length) = free
            .iter()
            .find(|(_, &length)| length >= size)
            .map(|(&start, &length)| (start, length))?;
        free.remove(&start);
        if length > size {
            free.insert(start + size, length - size);
        }
        self.used.fetch_add(size, Ordering::Relaxed);
        Some(BufHandle {
            segment_name: self.segment_name.clone(),
            segment_id: self.segment_id,
            offset: self.base + start,
            size,
            status: HandleStatus::Init,
        })
    }

    /// Return a handle's range to the free list, coalescing with adjacent
    /// free extents.
    pub fn free(&self, handle: &BufHandle) {
        debug_assert_eq!(handle.segment_id, self.segment_id);
        let mut ext = Extent::new(handle.offset - self.base, handle.size);
        let mut free = self.free.lock();
        if let Some((&prev_start, &prev_length)) = free.range(..ext.start).next_back() {
            if let Some(merged) = Extent::new(prev_start, prev_length).try_merge(&ext) {
                free.remove(&prev_start);
                ext = merged;
            }
        }
        if let Some(&next_length) = free.get(&ext.end()) {
            free.remove(&ext.end());
            ext.length += next_length;
        }
        free.insert(ext.start, ext.length);
        self.used.fetch_sub(handle.size, Ordering::Relaxed);
    }

    /// Snapshot the free extents, ordered by offset
    #[must_use]
    pub fn free_extents(&self) -> Vec<Extent> {
        self.free
            .lock()
            .iter()
            .map(|(&start, &length)| Extent::new(start, length))
            .collect()
    }
}
