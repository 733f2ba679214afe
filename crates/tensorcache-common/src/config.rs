//! Configuration for the tensorcache master.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Master service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Drain the delayed-GC queue in the background worker. Watermark
    /// eviction runs regardless of this flag.
    pub enable_gc: bool,
    /// Lease granted on every successful read or existence check, in
    /// milliseconds
    pub default_kv_lease_ttl_ms: u64,
    /// Fraction of total capacity to free on each eviction sweep, in [0, 1]
    pub eviction_ratio: f64,
    /// Occupancy fraction at which the worker starts evicting proactively,
    /// in [0, 1]
    pub eviction_high_watermark_ratio: f64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enable_gc: true,
            default_kv_lease_ttl_ms: 200,
            eviction_ratio: 0.1,
            eviction_high_watermark_ratio: 0.95,
        }
    }
}

impl MasterConfig {
    /// Validate ratio ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.eviction_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_ratio must be in [0, 1], got {}",
                self.eviction_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.eviction_high_watermark_ratio) {
            return Err(Error::invalid_params(format!(
                "eviction_high_watermark_ratio must be in [0, 1], got {}",
                self.eviction_high_watermark_ratio
            )));
        }
        Ok(())
    }
}
