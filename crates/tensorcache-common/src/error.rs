//! Error types for the tensorcache master.

use crate::types::ReplicaStatus;
use thiserror::Error;

/// Common result type for master operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type surfaced by every master operation.
///
/// Variants correspond one-to-one with the wire-level result codes the
/// transport layer reports to clients; see [`Error::code`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Validation errors: caller supplied malformed input, no state change
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    // State errors: preconditions unmet, caller may retry or adapt
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("no replica of {0} is complete yet")]
    ReplicaNotReady(String),

    #[error("invalid write on {key}: replica status is {status}")]
    InvalidWrite { key: String, status: ReplicaStatus },

    #[error("object has an unexpired lease: {0}")]
    ObjectHasLease(String),

    // Capacity errors: allocator cannot satisfy, back off and retry
    #[error("no available handle for {requested} bytes")]
    NoAvailableHandle { requested: u64 },

    // Internal errors: invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-parameters error
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller can expect a later retry of the same request to
    /// succeed without changing it
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAvailableHandle { .. } | Self::ObjectHasLease(_))
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_))
    }

    /// Get the wire-stable result code for the transport layer
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "INVALID_PARAMS",
            Self::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            Self::ObjectAlreadyExists(_) => "OBJECT_ALREADY_EXISTS",
            Self::ReplicaNotReady(_) => "REPLICA_IS_NOT_READY",
            Self::InvalidWrite { .. } => "INVALID_WRITE",
            Self::ObjectHasLease(_) => "OBJECT_HAS_LEASE",
            Self::NoAvailableHandle { .. } => "NO_AVAILABLE_HANDLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
