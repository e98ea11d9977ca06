//! Tunables for the distributed transaction manager

use serde::{Deserialize, Serialize};

/// Coordinator-side tunables. Constructor-injected; there is no global
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtxConfig {
    /// Phase-2 broadcast attempts after the first failure, with a full
    /// gang reconnect between attempts.
    pub phase2_retry_count: u32,
    /// Pause between phase-2 retry attempts, in milliseconds. This pause
    /// is the only point in phase 2 where cancellation is honored.
    pub retry_pause_ms: u64,
}

impl Default for DtxConfig {
    fn default() -> Self {
        Self {
            phase2_retry_count: 10,
            retry_pause_ms: 100,
        }
    }
}
