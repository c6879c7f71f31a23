//! Signaling protocol message definitions.
//!
//! Messages travel as JSON text frames with a `type` discriminator. Negotiation
//! payloads (`sdp`, `candidate`) are carried as opaque JSON values and are
//! forwarded verbatim; the relay never looks inside them.

use crate::registry::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Messages sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Ask the relay to provision a fresh room
    CreateRoom,

    /// Join an existing room
    JoinRoom {
        /// Room to join
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// Session description offer for the other member
    Offer {
        /// Opaque session description
        sdp: Value,
    },

    /// Session description answer for the other member
    Answer {
        /// Opaque session description
        sdp: Value,
    },

    /// Connectivity candidate for the other member
    IceCandidate {
        /// Opaque candidate
        candidate: Value,
    },
}

/// Messages sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Reply to [`ClientMessage::CreateRoom`]
    RoomCreated {
        /// Identifier of the new room
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    /// The other participant joined the room
    UserJoined,

    /// The other participant left the room
    UserLeft,

    /// A request from this client was rejected
    ErrorMessage {
        /// Machine-readable reason
        code: ErrorCode,
        /// Human-readable reason
        message: String,
    },

    /// Forwarded offer
    Offer {
        /// Opaque session description
        sdp: Value,
    },

    /// Forwarded answer
    Answer {
        /// Opaque session description
        sdp: Value,
    },

    /// Forwarded candidate
    IceCandidate {
        /// Opaque candidate
        candidate: Value,
    },
}

/// Relay rejection codes carried in [`ServerMessage::ErrorMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Room does not exist
    RoomNotFound,
    /// Room already holds two participants
    RoomFull,
    /// Room outlived its lifetime
    RoomExpired,
    /// Relay cannot provision more rooms
    ServerFull,
    /// Inbound frame could not be parsed
    InvalidMessage,
}

impl ErrorCode {
    /// Default human-readable text for the code
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "Room does not exist",
            ErrorCode::RoomFull => "Room full",
            ErrorCode::RoomExpired => "Room expired",
            ErrorCode::ServerFull => "Server at capacity",
            ErrorCode::InvalidMessage => "Invalid message",
        }
    }
}

impl ServerMessage {
    /// Build an error message with the code's default text
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        ServerMessage::ErrorMessage {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Deserialization(e.to_string()))
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated { .. } => "room-created",
            ServerMessage::UserJoined => "user-joined",
            ServerMessage::UserLeft => "user-left",
            ServerMessage::ErrorMessage { .. } => "error-message",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

impl ClientMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Deserialization(e.to_string()))
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom => "create-room",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Relay errors
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// The dispatcher task is no longer running
    #[error("relay dispatcher stopped")]
    DispatcherClosed,

    /// The relay refused the request
    #[error("rejected: {}", .0.default_message())]
    Rejected(ErrorCode),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_room_wire_format() {
        let msg = ClientMessage::JoinRoom {
            room_id: RoomId::from("abc"),
        };
        let text = msg.to_json().unwrap();
        assert_eq!(text, r#"{"type":"join-room","roomId":"abc"}"#);
        assert_eq!(ClientMessage::from_json(&text).unwrap(), msg);
    }

    #[test]
    fn test_unit_messages_wire_format() {
        assert_eq!(
            ServerMessage::UserJoined.to_json().unwrap(),
            r#"{"type":"user-joined"}"#
        );
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"create-room"}"#).unwrap(),
            ClientMessage::CreateRoom
        );
    }

    #[test]
    fn test_offer_payload_is_opaque() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 0.0.0.0", "extra": [1, 2]});
        let text = format!(r#"{{"type":"offer","sdp":{sdp}}}"#);

        let msg = ClientMessage::from_json(&text).unwrap();
        assert_eq!(msg, ClientMessage::Offer { sdp: sdp.clone() });
    }

    #[test]
    fn test_error_message_wire_format() {
        let text = ServerMessage::error(ErrorCode::RoomFull).to_json().unwrap();
        assert_eq!(
            text,
            r#"{"type":"error-message","code":"room-full","message":"Room full"}"#
        );
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"teleport"}"#),
            Err(RelayError::Deserialization(_))
        ));
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_message_type() {
        assert_eq!(
            ClientMessage::IceCandidate {
                candidate: json!({})
            }
            .message_type(),
            "ice-candidate"
        );
        assert_eq!(ServerMessage::UserLeft.message_type(), "user-left");
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::Rejected(ErrorCode::RoomNotFound);
        assert_eq!(err.to_string(), "rejected: Room does not exist");
        assert_eq!(RelayError::DispatcherClosed.to_string(), "relay dispatcher stopped");
    }
}
