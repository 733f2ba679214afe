//! Core type definitions for the tensorcache master.
//!
//! Segments are identified by name (typically `ip:port`, opaque to the
//! master) plus a per-mount [`SegmentId`]; the descriptor types here are
//! what the transport layer returns to clients.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one mount of a segment.
///
/// A segment name can be re-mounted after an unmount; each mount gets a
/// fresh id so handles from the previous mount can never be confused with
/// the new allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Generate a new random segment ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of one replica of an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Replica allocated, client write in flight
    #[default]
    Processing,
    /// All slices written and committed
    Complete,
    /// Write failed or revoked; replica contents are garbage
    Failed,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single buffer handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStatus {
    /// Range reserved, contents not yet committed
    #[default]
    Init,
    /// Contents committed by the writer
    Complete,
    /// Write failed; range contents are garbage
    Failed,
    /// Owning segment is no longer mounted
    Unregistered,
}

impl fmt::Display for HandleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Unregistered => write!(f, "unregistered"),
        }
    }
}

/// Addressable byte range inside one mounted segment, as returned to
/// clients. Clients transfer object bytes directly against this range on
/// the owning worker; the master never touches the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDescriptor {
    /// Name of the owning segment
    pub segment_name: String,
    /// Absolute byte offset inside the segment's contributed region
    pub offset: u64,
    /// Length of the range in bytes
    pub size: u64,
    /// Handle status at snapshot time
    pub status: HandleStatus,
}

/// One full replica of an object: an ordered sequence of handles that
/// together tile the object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    /// Replica status at snapshot time
    pub status: ReplicaStatus,
    /// One handle per slice, in object order
    pub handles: Vec<HandleDescriptor>,
}

impl ReplicaDescriptor {
    /// Total byte length tiled by this replica
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.handles.iter().map(|h| h.size).sum()
    }
}

/// Replication parameters supplied with a put
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConfig {
    /// Number of independent replicas to allocate
    pub replica_num: usize,
    /// Segment to try first when allocating, e.g. to co-locate an object
    /// with its producer. Falls back to normal selection when the segment
    /// is absent or full.
    pub preferred_segment: Option<String>,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            replica_num: 1,
            preferred_segment: None,
        }
    }
}

impl ReplicateConfig {
    /// Single replica, no placement preference
    #[must_use]
    pub fn single() -> Self {
        Self::default()
    }

    /// A fixed replica count, no placement preference
    #[must_use]
    pub fn with_replicas(replica_num: usize) -> Self {
        Self {
            replica_num,
            preferred_segment: None,
        }
    }
}
