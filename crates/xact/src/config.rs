//! Tunables for the local transaction machine

use serde::{Deserialize, Serialize};

/// Session-level tunables. Constructor-injected; there is no global
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XactConfig {
    /// Newly assigned sub-XIDs are batched into one durable assignment
    /// record once this many accumulate.
    pub subxid_flush_batch: usize,
    /// A skip entry is recorded every this many stack pushes to let the
    /// current-xid walk leap over whole strides.
    pub skip_stride: usize,
    /// Sub-XID slots shared with reader participants before the cache
    /// overflows to the persistent lookup path.
    pub reader_cache_slots: usize,
}

impl Default for XactConfig {
    fn default() -> Self {
        Self {
            subxid_flush_batch: 64,
            skip_stride: 100,
            reader_cache_slots: 64,
        }
    }
}
