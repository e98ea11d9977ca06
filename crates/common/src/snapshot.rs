//! Distributed snapshot carried to participants
//!
//! The core treats snapshot contents as opaque beyond membership checks;
//! it only needs to ship the snapshot with each statement's context.

use crate::Gxid;
use serde::{Deserialize, Serialize};

/// Which distributed transactions were in flight when a statement's
/// snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DistributedSnapshot {
    /// All gxids below this had completed.
    pub xmin_distributed: Gxid,
    /// First gxid not yet started.
    pub xmax_distributed: Gxid,
    /// In-flight gxids in [xmin, xmax), sorted ascending.
    pub in_progress: Vec<Gxid>,
}

impl DistributedSnapshot {
    pub fn new(xmin: Gxid, xmax: Gxid, mut in_progress: Vec<Gxid>) -> Self {
        in_progress.sort_unstable();
        Self {
            xmin_distributed: xmin,
            xmax_distributed: xmax,
            in_progress,
        }
    }

    /// True if the given gxid was still in flight at snapshot time.
    pub fn is_in_progress(&self, gxid: Gxid) -> bool {
        if gxid < self.xmin_distributed {
            return false;
        }
        if gxid >= self.xmax_distributed {
            return true;
        }
        self.in_progress.binary_search(&gxid).is_ok()
    }
}
