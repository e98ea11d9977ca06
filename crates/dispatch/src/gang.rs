//! Gang layer: the session's connections to its worker processes
//!
//! [`LocalGang`] hosts each participant as a spawned task behind an
//! mpsc request/reply channel, which stands in for the point-to-point
//! connections a multi-process deployment would hold. Reconnecting
//! drops every channel (ending the tasks) and builds fresh ones from
//! the handler factory, so a handler that keeps state across a
//! reconnect must share it with the factory.

use crate::error::GangError;
use meridian_common::ParticipantId;
use meridian_protocol::WireEnvelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Request handler hosted by one participant task.
pub trait ParticipantHandler: Send + 'static {
    fn handle(&mut self, envelope: WireEnvelope) -> WireEnvelope;
}

impl<F> ParticipantHandler for F
where
    F: FnMut(WireEnvelope) -> WireEnvelope + Send + 'static,
{
    fn handle(&mut self, envelope: WireEnvelope) -> WireEnvelope {
        self(envelope)
    }
}

/// Builds a fresh handler for a participant, on first connect and on
/// every reconnect.
pub type HandlerFactory =
    Arc<dyn Fn(ParticipantId) -> Box<dyn ParticipantHandler> + Send + Sync>;

/// Connection layer to the session's worker processes.
pub trait Gang: Send + Sync {
    /// Participants this gang is connected to.
    fn participants(&self) -> Vec<ParticipantId>;

    /// Tear down every connection and establish fresh ones. A failed
    /// connection cannot be trusted to retry cleanly.
    fn disconnect_and_reconnect(&self) -> impl Future<Output = ()> + Send;

    /// Send one request to one participant and await its reply.
    fn send(
        &self,
        participant: ParticipantId,
        envelope: WireEnvelope,
    ) -> impl Future<Output = Result<WireEnvelope, GangError>> + Send;
}

type RequestSender = mpsc::UnboundedSender<(WireEnvelope, oneshot::Sender<WireEnvelope>)>;

/// In-process gang: every participant is a spawned task running its
/// handler over a request/reply channel.
pub struct LocalGang {
    members: Vec<ParticipantId>,
    factory: HandlerFactory,
    links: Mutex<HashMap<ParticipantId, RequestSender>>,
    reply_timeout_ms: u64,
}

impl LocalGang {
    pub fn new(members: Vec<ParticipantId>, factory: HandlerFactory) -> Self {
        let gang = Self {
            members,
            factory,
            links: Mutex::new(HashMap::new()),
            reply_timeout_ms: 5_000,
        };
        gang.connect_all();
        gang
    }

    pub fn with_reply_timeout_ms(mut self, reply_timeout_ms: u64) -> Self {
        self.reply_timeout_ms = reply_timeout_ms;
        self
    }

    fn connect_all(&self) {
        let mut links = self.links.lock();
        links.clear();
        for &member in &self.members {
            let handler = (self.factory)(member);
            links.insert(member, spawn_participant(member, handler));
        }
    }

    /// How many reconnect-surviving links exist; for tests.
    pub fn connected_count(&self) -> usize {
        self.links.lock().len()
    }
}

fn spawn_participant(
    participant: ParticipantId,
    mut handler: Box<dyn ParticipantHandler>,
) -> RequestSender {
    let (tx, mut rx) =
        mpsc::unbounded_channel::<(WireEnvelope, oneshot::Sender<WireEnvelope>)>();
    tokio::spawn(async move {
        while let Some((envelope, reply)) = rx.recv().await {
            let response = handler.handle(envelope);
            if reply.send(response).is_err() {
                tracing::trace!("[{}] requester went away before the reply", participant);
            }
        }
    });
    tx
}

impl Gang for LocalGang {
    fn participants(&self) -> Vec<ParticipantId> {
        self.members.clone()
    }

    async fn disconnect_and_reconnect(&self) {
        tracing::info!("gang reconnect: {} participants", self.members.len());
        self.connect_all();
    }

    async fn send(
        &self,
        participant: ParticipantId,
        envelope: WireEnvelope,
    ) -> Result<WireEnvelope, GangError> {
        let sender = {
            let links = self.links.lock();
            links
                .get(&participant)
                .cloned()
                .ok_or(GangError::NotConnected(participant))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send((envelope, reply_tx))
            .map_err(|_| GangError::ConnectionClosed(participant))?;

        match tokio::time::timeout(
            std::time::Duration::from_millis(self.reply_timeout_ms),
            reply_rx,
        )
        .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GangError::ConnectionClosed(participant)),
            Err(_) => Err(GangError::Timeout(participant, self.reply_timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_factory() -> HandlerFactory {
        Arc::new(|participant| {
            Box::new(move |envelope: WireEnvelope| {
                WireEnvelope::new(
                    format!("{}: ok", participant).into_bytes(),
                    envelope.headers,
                )
            })
        })
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let gang = LocalGang::new(
            vec![ParticipantId::new(1), ParticipantId::new(2)],
            echo_factory(),
        );

        let reply = gang
            .send(ParticipantId::new(2), WireEnvelope::default())
            .await
            .unwrap();
        assert_eq!(reply.body, b"seg2: ok");
    }

    #[tokio::test]
    async fn test_send_to_unknown_participant() {
        let gang = LocalGang::new(vec![ParticipantId::new(1)], echo_factory());

        let err = gang
            .send(ParticipantId::new(9), WireEnvelope::default())
            .await
            .unwrap_err();
        assert_eq!(err, GangError::NotConnected(ParticipantId::new(9)));
    }

    #[tokio::test]
    async fn test_reconnect_builds_fresh_handlers() {
        let generation = Arc::new(AtomicUsize::new(0));
        let factory_generation = generation.clone();
        let factory: HandlerFactory = Arc::new(move |_| {
            let generation = factory_generation.fetch_add(1, Ordering::SeqCst);
            Box::new(move |_: WireEnvelope| {
                WireEnvelope::new(format!("gen{}", generation).into_bytes(), HashMap::new())
            })
        });

        let gang = LocalGang::new(vec![ParticipantId::new(1)], factory);
        let before = gang
            .send(ParticipantId::new(1), WireEnvelope::default())
            .await
            .unwrap();
        assert_eq!(before.body, b"gen0");

        gang.disconnect_and_reconnect().await;
        let after = gang
            .send(ParticipantId::new(1), WireEnvelope::default())
            .await
            .unwrap();
        assert_eq!(after.body, b"gen1");
        assert_eq!(gang.connected_count(), 1);
    }
}
