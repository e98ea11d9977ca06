//! Coordinator-to-participant protocol vocabulary
//!
//! This crate defines the commands the coordinator broadcasts to drive
//! two-phase commit, the per-statement context copied to every
//! participant, and the typed envelope/response shapes the gang layer
//! carries. Nothing here performs I/O.

mod commands;
mod context;
mod messages;
mod responses;

pub use commands::DtxProtocolCommand;
pub use context::DtxContextInfo;
pub use messages::{DtxMessage, ParseError, WireEnvelope};
pub use responses::{DtxResponse, ParticipantStatus};
