//! Participant identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one worker process within the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ParticipantId(u16);

impl ParticipantId {
    pub const fn new(raw: u16) -> Self {
        ParticipantId(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{}", self.0)
    }
}
