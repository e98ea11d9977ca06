//! Typed wrapper over the wire envelope for protocol commands

use crate::{DtxContextInfo, DtxProtocolCommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Raw message the gang layer carries: a header map plus a serialized
/// body. The typed [`DtxMessage`] converts to and from this shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WireEnvelope {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WireEnvelope {
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { headers, body }
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }
}

/// One protocol command addressed to a participant.
#[derive(Debug, Clone, PartialEq)]
pub struct DtxMessage {
    pub command: DtxProtocolCommand,
    /// Correlation key; identical across every participant's view of one
    /// distributed transaction.
    pub gid: String,
    /// Statement context; present on statement-carrying and subtransaction
    /// commands, absent on bare phase-2 notifications.
    pub context: Option<DtxContextInfo>,
    /// Savepoint name for the subtransaction commands.
    pub savepoint_name: Option<String>,
}

impl DtxMessage {
    pub fn new(command: DtxProtocolCommand, gid: String) -> Self {
        Self {
            command,
            gid,
            context: None,
            savepoint_name: None,
        }
    }

    pub fn with_context(mut self, context: DtxContextInfo) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_savepoint(mut self, name: String) -> Self {
        self.savepoint_name = Some(name);
        self
    }

    /// Convert to a raw envelope for sending.
    pub fn into_envelope(self) -> WireEnvelope {
        let mut headers = HashMap::new();
        headers.insert("dtx_command".to_string(), self.command.as_str().to_string());
        headers.insert("gid".to_string(), self.gid);
        if let Some(name) = self.savepoint_name {
            headers.insert("savepoint".to_string(), name);
        }

        let body = match self.context {
            // Context serialization cannot fail: the type is a closed set
            // of serde-friendly fields.
            Some(ctx) => serde_json::to_vec(&ctx).expect("context serializes"),
            None => Vec::new(),
        };

        WireEnvelope::new(body, headers)
    }

    /// Parse a raw envelope into a typed message.
    pub fn from_envelope(envelope: WireEnvelope) -> Result<Self, ParseError> {
        let command_str = envelope
            .get_header("dtx_command")
            .ok_or(ParseError::MissingHeader("dtx_command"))?;
        let command = DtxProtocolCommand::parse(command_str)
            .ok_or_else(|| ParseError::InvalidCommand(command_str.to_string()))?;

        let gid = envelope
            .get_header("gid")
            .ok_or(ParseError::MissingHeader("gid"))?
            .to_string();

        let savepoint_name = envelope.get_header("savepoint").map(String::from);

        let context = if envelope.body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(&envelope.body)
                    .map_err(|e| ParseError::InvalidContext(e.to_string()))?,
            )
        };

        Ok(Self {
            command,
            gid,
            context,
            savepoint_name,
        })
    }
}

/// Errors that can occur when parsing envelopes
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid protocol command: {0}")]
    InvalidCommand(String),

    #[error("Invalid context payload: {0}")]
    InvalidContext(String),
}
