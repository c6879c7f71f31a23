//! Host platform negotiation contract.
//!
//! The platform (a browser runtime, a WebRTC stack, or the in-memory mock)
//! generates session descriptions, gathers connectivity candidates and
//! encrypts the direct channel. This crate only drives it through the traits
//! below and consumes its [`PeerEvent`] stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the host platform
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Generating or applying a session description failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A connectivity candidate was rejected
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// The data channel is not open
    #[error("channel closed")]
    ChannelClosed,

    /// The peer connection has been closed
    #[error("peer connection closed")]
    Closed,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer from the initiating side
    Offer,
    /// Answer from the accepting side
    Answer,
}

/// Session description in the `{type, sdp}` shape of the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Opaque description body
    pub sdp: String,
}

/// Connectivity candidate in the shape of the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Opaque candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// Peer connection state as surfaced by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet negotiating
    New,
    /// Negotiation in progress
    Connecting,
    /// Direct path established
    Connected,
    /// Path lost, may not recover
    Disconnected,
    /// Path failed
    Failed,
    /// Connection closed
    Closed,
}

impl ConnectionState {
    /// Whether this state ends the session
    #[must_use]
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// One message on the direct channel
///
/// Control frames travel as text, payload chunks as binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events surfaced by a peer connection and its data channel
#[derive(Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer
    IceCandidate(IceCandidate),
    /// The connection changed state
    ConnectionState(ConnectionState),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// The data channel opened
    ChannelOpen,
    /// A message arrived on the data channel
    ChannelMessage(ChannelMessage),
    /// The data channel closed
    ChannelClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(_) => f.write_str("IceCandidate"),
            PeerEvent::ConnectionState(state) => write!(f, "ConnectionState({state:?})"),
            PeerEvent::DataChannel(channel) => write!(f, "DataChannel({:?})", channel.label()),
            PeerEvent::ChannelOpen => f.write_str("ChannelOpen"),
            PeerEvent::ChannelMessage(message) => {
                write!(f, "ChannelMessage({} bytes)", message.len())
            }
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// Stream of events for one peer connection
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Offer/answer/candidate contract of the host platform
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a local data channel; must precede offer generation
    async fn create_data_channel(&self, label: &str)
    -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a locally generated description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply the peer's description
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    /// Add a candidate received from the peer
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Release the connection
    async fn close(&self);
}

/// Ordered, reliable direct channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Queue a message for the peer
    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;

    /// Bytes queued but not yet handed to the network
    fn buffered_amount(&self) -> usize;

    /// Whether the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_wire_shape() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&desc).unwrap(),
            json!({"type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_candidate_optional_fields() {
        let parsed: IceCandidate =
            serde_json::from_value(json!({"candidate": "candidate:1 1 udp"})).unwrap();
        assert_eq!(parsed.sdp_mid, None);

        let full: IceCandidate = serde_json::from_value(
            json!({"candidate": "c", "sdpMid": "0", "sdpMLineIndex": 0}),
        )
        .unwrap();
        assert_eq!(full.sdp_mid.as_deref(), Some("0"));
        assert_eq!(full.sdp_m_line_index, Some(0));
    }

    #[test]
    fn test_lost_states() {
        assert!(ConnectionState::Failed.is_lost());
        assert!(ConnectionState::Disconnected.is_lost());
        assert!(!ConnectionState::Connecting.is_lost());
        assert!(!ConnectionState::Connected.is_lost());
    }
}
