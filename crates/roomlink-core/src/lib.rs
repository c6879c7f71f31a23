//! # RoomLink Core
//!
//! Client side of RoomLink: negotiates a direct channel with the other room
//! member through the relay, then moves batches of files over it.
//!
//! This crate provides:
//! - [`transport`]: the host platform contract ([`PeerConnection`], [`DataChannel`])
//! - [`ConnectionNegotiator`]: offer/answer/candidate exchange until the channel opens
//! - [`TransferStateMachine`]: observable `idle → waiting → connected → transferring → done/error`
//! - [`transfer`]: manifest, chunking, backpressure and reassembly
//! - [`PeerSession`]: an open session that sends or receives batches
//! - `mock` (feature `mock`): in-memory host platform
//!
//! ## Example
//!
//! ```rust,ignore
//! use roomlink_core::{ConnectionNegotiator, OutgoingFile, Role, TransferConfig, TransferStateMachine};
//!
//! let negotiator = ConnectionNegotiator::new(
//!     Role::Sender, room_id, peer, events, link, TransferStateMachine::new(),
//! );
//! let mut session = negotiator.connect().await?;
//! let files = vec![OutgoingFile::open("report.pdf").await?];
//! session.send_files(files, &TransferConfig::default(), |p| println!("{}%", p.percent), cancel).await?;
//! session.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod negotiator;
pub mod session;
pub mod signal;
pub mod state;
pub mod transfer;
pub mod transport;

pub use error::{Error, NegotiationError, Result, StateError, TransferError};
pub use frame::{ControlFrame, FileDescriptor, Frame};
pub use negotiator::{ConnectionNegotiator, Role};
pub use session::PeerSession;
#[cfg(feature = "ws")]
pub use signal::WsLink;
pub use signal::{RelayLink, SignalLink};
pub use state::{TransferStateMachine, TransferStatus};
pub use transfer::{
    BatchSummary, FileManifestEntry, OutgoingFile, ProgressEvent, ProtocolViolation,
    ReceiveEvent, ReceivedFile, TransferConfig, TransferReceiver, TransferSender,
};
pub use transport::{
    ChannelMessage, ConnectionState, DataChannel, IceCandidate, PeerConnection, PeerEvent,
    PeerEvents, SdpKind, SessionDescription, TransportError,
};

/// Label of the data channel the sender opens
pub const CHANNEL_LABEL: &str = "fileTransfer";
