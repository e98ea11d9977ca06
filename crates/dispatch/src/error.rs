//! Error types for the gang and dispatcher layers

use meridian_common::ParticipantId;
use meridian_protocol::DtxProtocolCommand;
use std::fmt;
use thiserror::Error;

/// Transport-level failure talking to one participant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GangError {
    #[error("participant {0} is not connected")]
    NotConnected(ParticipantId),

    #[error("connection to participant {0} closed")]
    ConnectionClosed(ParticipantId),

    #[error("participant {0} did not reply within {1}ms")]
    Timeout(ParticipantId, u64),
}

/// One participant's contribution to a failed broadcast.
#[derive(Debug, Clone)]
pub struct ParticipantFailure {
    pub participant: ParticipantId,
    pub detail: String,
}

/// A broadcast that did not get the expected status from every targeted
/// participant. Retry policy belongs to the caller; `gang_unusable`
/// tells it whether the connections themselves can still be trusted.
#[derive(Debug, Error)]
pub struct BroadcastError {
    pub command: DtxProtocolCommand,
    pub total: usize,
    pub failures: Vec<ParticipantFailure>,
    /// A transport failure (not a clean refusal) occurred somewhere; the
    /// caller should disconnect and reconnect before retrying.
    pub gang_unusable: bool,
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} broadcast failed on {}/{} participants{}",
            self.command,
            self.failures.len(),
            self.total,
            if self.gang_unusable {
                " (gang unusable)"
            } else {
                ""
            }
        )
    }
}
