//! Participant gang abstraction and broadcast dispatcher
//!
//! The [`Gang`] trait is the connection layer to one session's worker
//! processes: list participants, tear down and re-establish every
//! connection, send one request and await its reply. [`LocalGang`] is
//! the in-process implementation, hosting each participant as a spawned
//! task behind an mpsc request/reply channel. On top of it,
//! [`dispatch_dtx_command`] broadcasts one protocol command to a set of
//! participants and succeeds only if every one of them did.

mod dispatcher;
mod error;
mod gang;

pub use dispatcher::{dispatch_dtx_command, DispatchOutcome};
pub use error::{BroadcastError, GangError, ParticipantFailure};
pub use gang::{Gang, HandlerFactory, LocalGang, ParticipantHandler};
