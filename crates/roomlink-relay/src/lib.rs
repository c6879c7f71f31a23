//! # RoomLink Relay
//!
//! Control plane for RoomLink: pairs exactly two participants in a short-lived
//! room and forwards their connection-negotiation messages to each other.
//!
//! This crate provides:
//! - [`RoomRegistry`]: two-slot rooms with bounded lifetime
//! - [`SignalingRelay`]: pure message router over the registry
//! - [`RelayHandle`]: single-task dispatcher serializing all room mutation
//! - `RelayServer` (feature `server`): axum WebSocket + HTTP front end
//!
//! The relay never inspects offers, answers or candidates and never sees file
//! content; transfers run over the direct channel the peers negotiate.
//!
//! ## Architecture
//!
//! ```text
//!   WebSocket A ──┐                          ┌── WebSocket B
//!                 ▼                          ▼
//!            ┌──────────────────────────────────────┐
//!            │  RelayDispatcher (one tokio task)    │
//!            │    SignalingRelay ── RoomRegistry    │
//!            └──────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use roomlink_relay::{ClientMessage, RelayConfig, RelayHandle, ServerMessage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayHandle::spawn(RelayConfig::default());
//! let room_id = relay.create_room().await?;
//!
//! let mut sender = relay.connect().await?;
//! let mut receiver = relay.connect().await?;
//! sender.send(ClientMessage::JoinRoom { room_id: room_id.clone() })?;
//! receiver.send(ClientMessage::JoinRoom { room_id })?;
//!
//! assert_eq!(sender.recv().await, Some(ServerMessage::UserJoined));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod relay;
#[cfg(feature = "server")]
pub mod server;

pub use dispatcher::{Inbound, Outbound, RelayConnection, RelayHandle, RelaySender, RelayStats};
pub use protocol::{ClientMessage, ErrorCode, RelayError, ServerMessage};
pub use registry::{
    DEFAULT_ROOM_ID_BYTES, MAX_PARTICIPANTS, MIN_ROOM_ID_BYTES, ParticipantId, RoomId,
    RoomRegistry,
};
pub use relay::{Delivery, RelayConfig, SignalingRelay};
#[cfg(feature = "server")]
pub use server::{RelayServer, router};

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 5000;

/// WebSocket path on the relay server
pub const SIGNALING_PATH: &str = "/ws";
