//! Participant responses to protocol commands

use meridian_common::{Gxid, ParticipantId};
use serde::{Deserialize, Serialize};

/// Outcome of one protocol command on one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    /// The participant performed the command.
    Succeeded,
    /// The participant refused or failed the command.
    Failed,
}

/// One participant's reply to a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtxResponse {
    pub participant: ParticipantId,
    pub status: ParticipantStatus,
    /// Other in-flight distributed transactions this participant requires
    /// the coordinator to see finished before treating its own notify as
    /// complete.
    pub wait_gxids: Vec<Gxid>,
    /// Human-readable failure detail.
    pub detail: Option<String>,
}

impl DtxResponse {
    pub fn succeeded(participant: ParticipantId) -> Self {
        Self {
            participant,
            status: ParticipantStatus::Succeeded,
            wait_gxids: Vec::new(),
            detail: None,
        }
    }

    pub fn failed(participant: ParticipantId, detail: impl Into<String>) -> Self {
        Self {
            participant,
            status: ParticipantStatus::Failed,
            wait_gxids: Vec::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_wait_gxids(mut self, wait_gxids: Vec<Gxid>) -> Self {
        self.wait_gxids = wait_gxids;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ParticipantStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_constructors() {
        let ok = DtxResponse::succeeded(ParticipantId::new(1));
        assert!(ok.is_success());
        assert!(ok.wait_gxids.is_empty());

        let failed = DtxResponse::failed(ParticipantId::new(2), "disk full");
        assert!(!failed.is_success());
        assert_eq!(failed.detail.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let resp = DtxResponse::succeeded(ParticipantId::new(3))
            .with_wait_gxids(vec![Gxid::new(7), Gxid::new(9)]);
        let bytes = serde_json::to_vec(&resp).unwrap();
        let back: DtxResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, resp);
    }
}
