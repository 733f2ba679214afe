//! Common types for the tensorcache master.
//!
//! This crate defines the error taxonomy, the descriptor types exchanged
//! with clients, and the master configuration. It carries no behavior of
//! its own; the metadata engine lives in `tensorcache-master`.

pub mod config;
pub mod error;
pub mod types;

pub use config::MasterConfig;
pub use error::{Error, Result};
pub use types::{
    HandleDescriptor, HandleStatus, ReplicaDescriptor, ReplicaStatus, ReplicateConfig, SegmentId,
};
