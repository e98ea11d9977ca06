//! Interface to the out-of-band recovery process
//!
//! The background process that reconciles orphaned or in-doubt prepared
//! transactions lives outside this core. The manager only hands GIDs
//! across this seam: abort-prepared retry exhaustion notes an orphan,
//! and the resolver polls `in_doubt_gids` to learn what still needs
//! work.

use parking_lot::Mutex;

/// What the distributed transaction manager needs from the recovery
/// process.
pub trait RecoveryService: Send + Sync {
    /// An abort notification could not be confirmed on every
    /// participant; recovery owns the GID from here.
    fn note_orphaned_prepared(&self, gid: &str, reason: &str);

    /// GIDs the background resolver still has to reconcile.
    fn in_doubt_gids(&self) -> Vec<String>;
}

/// Recovery stub that records hand-offs in memory.
#[derive(Default)]
pub struct InMemoryRecovery {
    orphaned: Mutex<Vec<(String, String)>>,
}

impl InMemoryRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orphaned(&self) -> Vec<(String, String)> {
        self.orphaned.lock().clone()
    }
}

impl RecoveryService for InMemoryRecovery {
    fn note_orphaned_prepared(&self, gid: &str, reason: &str) {
        tracing::warn!("handing {} to recovery: {}", gid, reason);
        self.orphaned
            .lock()
            .push((gid.to_string(), reason.to_string()));
    }

    fn in_doubt_gids(&self) -> Vec<String> {
        self.orphaned.lock().iter().map(|(gid, _)| gid.clone()).collect()
    }
}
