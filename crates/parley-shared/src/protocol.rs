use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::message::Message;
use crate::types::ConnectionId;

/// Events pushed from the server to a live connection.
///
/// Encoded as `{"type": "...", "payload": ...}` JSON text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame on every authenticated connection
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// A new message addressed to the connection's user
    Message(Message),
}

/// Frames a client may send over its live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Refresh the sender's presence
    Heartbeat,
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, SharedError> {
        serde_json::to_string(self).map_err(|e| SharedError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self, SharedError> {
        serde_json::from_str(data).map_err(|e| SharedError::Serialization(e.to_string()))
    }
}

impl ClientEvent {
    pub fn from_json(data: &str) -> Result<Self, SharedError> {
        serde_json::from_str(data).map_err(|e| SharedError::Serialization(e.to_string()))
    }
}
