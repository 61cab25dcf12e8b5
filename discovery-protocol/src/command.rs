//! Command vocabulary exchanged between listener and registrants.
//!
//! Every payload is a JSON object `{"command": ..., "data": ...}`. Replies
//! carry `{"status": ..., "message": ...}` in `data`, plus `node_id` for
//! REGISTER.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Reply sent when a frame fails its checksum or cannot be parsed.
pub const RECEIVED_WRONG_MESSAGE: &str = "Server received wrong message!";
/// Reply sent for commands the listener does not handle.
pub const UNKNOWN_COMMAND: &str = "Unknown Command!";
/// Free-form payload of an UNREGISTER request.
pub const UNREGISTER_NOTICE: &str = "Client Unregister Service!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Register,
    Unregister,
    Heartbeat,
    Error,
    Warning,
    Message,
    /// Any command string outside the vocabulary. Never sent.
    #[serde(other)]
    Unrecognized,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Register => "REGISTER",
            Command::Unregister => "UNREGISTER",
            Command::Heartbeat => "HEARTBEAT",
            Command::Error => "ERROR",
            Command::Warning => "WARNING",
            Command::Message => "MESSAGE",
            Command::Unrecognized => "UNRECOGNIZED",
        };
        f.write_str(s)
    }
}

/// Statuts du protocole : réponses, santé du cluster, état d'une connexion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Success,
    Failure,
    Green,
    Red,
    Connected,
    Registered,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
            Status::Green => "GREEN",
            Status::Red => "RED",
            Status::Connected => "CONNECTED",
            Status::Registered => "REGISTERED",
        };
        f.write_str(s)
    }
}

/// Decoded logical unit carried by one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    #[serde(default)]
    pub data: Value,
}

/// `data` of a reply, as sent by the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Message {
    pub fn new(command: Command, data: Value) -> Self {
        Self { command, data }
    }

    pub fn reply(command: Command, status: Status, message: impl Into<String>) -> Self {
        let reply = Reply { status, message: message.into(), node_id: None };
        Self::new(command, json!(reply))
    }

    pub fn register_success(node_id: &str) -> Self {
        let reply = Reply {
            status: Status::Success,
            message: Status::Success.to_string(),
            node_id: Some(node_id.to_string()),
        };
        Self::new(Command::Register, json!(reply))
    }

    pub fn wrong_message() -> Self {
        Self::reply(Command::Error, Status::Failure, RECEIVED_WRONG_MESSAGE)
    }

    pub fn unknown_command() -> Self {
        Self::reply(Command::Error, Status::Failure, UNKNOWN_COMMAND)
    }

    pub fn unregister() -> Self {
        Self::new(Command::Unregister, Value::String(UNREGISTER_NOTICE.to_string()))
    }

    /// Interprète `data` comme une réponse `{status, message, node_id?}`
    pub fn as_reply(&self) -> Result<Reply> {
        serde_json::from_value(self.data.clone())
            .map_err(|_| ProtocolError::UnexpectedReply(format!("{} {}", self.command, self.data)))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
