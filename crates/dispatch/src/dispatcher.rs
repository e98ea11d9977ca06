//! Broadcast dispatcher
//!
//! One primitive: send a protocol command to exactly the given
//! participants, collect every response, and succeed only if every one
//! of them returned the expected status. Whether and how to retry is the
//! caller's decision; the structured error says which participants
//! failed and whether the gang itself is still trustworthy.

use crate::error::{BroadcastError, ParticipantFailure};
use crate::gang::Gang;
use meridian_common::{Gxid, ParticipantId};
use meridian_protocol::{DtxMessage, DtxResponse};

/// Responses from a fully successful broadcast.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub responses: Vec<DtxResponse>,
}

impl DispatchOutcome {
    /// Every wait-gxid any participant returned, deduplicated.
    pub fn wait_gxids(&self) -> Vec<Gxid> {
        let mut gxids: Vec<Gxid> = self
            .responses
            .iter()
            .flat_map(|r| r.wait_gxids.iter().copied())
            .collect();
        gxids.sort_unstable();
        gxids.dedup();
        gxids
    }
}

/// Broadcast `message` to `targets`, requiring success from all of them.
pub async fn dispatch_dtx_command<G: Gang>(
    gang: &G,
    message: &DtxMessage,
    targets: &[ParticipantId],
) -> Result<DispatchOutcome, BroadcastError> {
    let mut responses = Vec::with_capacity(targets.len());
    let mut failures = Vec::new();
    let mut gang_unusable = false;

    for &participant in targets {
        let envelope = message.clone().into_envelope();
        match gang.send(participant, envelope).await {
            Ok(reply) => match serde_json::from_slice::<DtxResponse>(&reply.body) {
                Ok(response) if response.is_success() => responses.push(response),
                Ok(response) => {
                    failures.push(ParticipantFailure {
                        participant,
                        detail: response
                            .detail
                            .unwrap_or_else(|| "command failed".to_string()),
                    });
                }
                Err(e) => {
                    // A garbled reply means the connection state is not
                    // trustworthy either.
                    failures.push(ParticipantFailure {
                        participant,
                        detail: format!("unparseable reply: {e}"),
                    });
                    gang_unusable = true;
                }
            },
            Err(e) => {
                failures.push(ParticipantFailure {
                    participant,
                    detail: e.to_string(),
                });
                gang_unusable = true;
            }
        }
    }

    if failures.is_empty() {
        Ok(DispatchOutcome { responses })
    } else {
        tracing::warn!(
            "{} broadcast: {}/{} participants failed",
            message.command,
            failures.len(),
            targets.len()
        );
        Err(BroadcastError {
            command: message.command,
            total: targets.len(),
            failures,
            gang_unusable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gang::{HandlerFactory, LocalGang};
    use meridian_protocol::{DtxProtocolCommand, WireEnvelope};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn respond(response: DtxResponse) -> WireEnvelope {
        WireEnvelope::new(serde_json::to_vec(&response).unwrap(), HashMap::new())
    }

    fn all_succeed_factory() -> HandlerFactory {
        Arc::new(|participant| {
            Box::new(move |_: WireEnvelope| {
                respond(DtxResponse::succeeded(participant))
            })
        })
    }

    fn prepare_message() -> DtxMessage {
        DtxMessage::new(DtxProtocolCommand::Prepare, "1234-0000000056".to_string())
    }

    #[tokio::test]
    async fn test_all_participants_succeed() {
        let targets = vec![ParticipantId::new(1), ParticipantId::new(2)];
        let gang = LocalGang::new(targets.clone(), all_succeed_factory());

        let outcome = dispatch_dtx_command(&gang, &prepare_message(), &targets)
            .await
            .unwrap();
        assert_eq!(outcome.responses.len(), 2);
        assert!(outcome.wait_gxids().is_empty());
    }

    #[tokio::test]
    async fn test_one_refusal_fails_the_broadcast() {
        let targets = vec![ParticipantId::new(1), ParticipantId::new(2)];
        let factory: HandlerFactory = Arc::new(|participant| {
            Box::new(move |_: WireEnvelope| {
                if participant == ParticipantId::new(2) {
                    respond(DtxResponse::failed(participant, "out of disk"))
                } else {
                    respond(DtxResponse::succeeded(participant))
                }
            })
        });
        let gang = LocalGang::new(targets.clone(), factory);

        let err = dispatch_dtx_command(&gang, &prepare_message(), &targets)
            .await
            .unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].participant, ParticipantId::new(2));
        assert_eq!(err.failures[0].detail, "out of disk");
        // A clean refusal leaves the connections trustworthy.
        assert!(!err.gang_unusable);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_gang_unusable() {
        let targets = vec![ParticipantId::new(1), ParticipantId::new(2)];
        let gang = LocalGang::new(vec![ParticipantId::new(1)], all_succeed_factory());

        let err = dispatch_dtx_command(&gang, &prepare_message(), &targets)
            .await
            .unwrap_err();
        assert!(err.gang_unusable);
        assert_eq!(err.total, 2);
    }

    #[tokio::test]
    async fn test_wait_gxids_are_collected_and_deduplicated() {
        let targets = vec![ParticipantId::new(1), ParticipantId::new(2)];
        let factory: HandlerFactory = Arc::new(|participant| {
            Box::new(move |_: WireEnvelope| {
                respond(
                    DtxResponse::succeeded(participant)
                        .with_wait_gxids(vec![Gxid::new(9), Gxid::new(7)]),
                )
            })
        });
        let gang = LocalGang::new(targets.clone(), factory);

        let outcome = dispatch_dtx_command(&gang, &prepare_message(), &targets)
            .await
            .unwrap();
        assert_eq!(outcome.wait_gxids(), vec![Gxid::new(7), Gxid::new(9)]);
    }

    #[tokio::test]
    async fn test_garbled_reply_is_a_transport_failure() {
        let targets = vec![ParticipantId::new(1)];
        let factory: HandlerFactory = Arc::new(|_| {
            Box::new(move |_: WireEnvelope| {
                WireEnvelope::new(b"not json".to_vec(), HashMap::new())
            })
        });
        let gang = LocalGang::new(targets.clone(), factory);

        let err = dispatch_dtx_command(&gang, &prepare_message(), &targets)
            .await
            .unwrap_err();
        assert!(err.gang_unusable);
    }
}
