//! Client-side connection negotiation.
//!
//! Drives the host platform's offer/answer/candidate exchange through the
//! relay until the direct channel opens:
//!
//! ```text
//!  Sender                        Relay                       Receiver
//!    │ create channel              │                              │
//!    │── join-room ──────────────► │ ◄────────────── join-room ───│
//!    │ ◄──────────── user-joined ──│                              │
//!    │── offer ──────────────────► │ ─────────────────── offer ──►│
//!    │ ◄─────────────────── answer │ ◄──────────────── answer ────│
//!    │ ◄────── ice-candidate ─────►│◄────── ice-candidate ───────►│
//!    │ channel open                                  channel open │
//! ```
//!
//! Every exit path releases the channel, the peer connection and the
//! signaling link through [`ConnectionNegotiator::cleanup`]. A negotiator
//! dropped mid-flight, such as a `connect` future under a timeout, closes
//! its peer connection in the background.

use crate::CHANNEL_LABEL;
use crate::error::{Error, NegotiationError, Result};
use crate::session::PeerSession;
use crate::signal::SignalLink;
use crate::state::{TransferStateMachine, TransferStatus};
use crate::transport::{
    ChannelMessage, DataChannel, IceCandidate, PeerConnection, PeerEvent, PeerEvents, SdpKind,
    SessionDescription, TransportError,
};
use roomlink_relay::{ClientMessage, ErrorCode, RoomId, ServerMessage};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which side of the transfer this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the channel and the offer, then sends files
    Sender,
    /// Answers the offer, then receives files
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

enum Input {
    Signal(Option<ServerMessage>),
    Peer(Option<PeerEvent>),
}

/// Negotiation state for one session
pub struct ConnectionNegotiator {
    role: Role,
    room_id: RoomId,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    link: Box<dyn SignalLink>,
    status: TransferStateMachine,
    channel: Option<Arc<dyn DataChannel>>,
    /// Channel messages that raced ahead of the open event
    pending: Vec<ChannelMessage>,
    connected: bool,
    cleaned_up: bool,
    release: ReleaseOnDrop,
}

/// Closes the peer connection of a negotiator that never finished
struct ReleaseOnDrop {
    peer: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    armed: bool,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let peer = self.peer.clone();
        let channel = self.channel.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Negotiator dropped; releasing its peer connection");
                runtime.spawn(async move {
                    if let Some(channel) = channel {
                        channel.close().await;
                    }
                    peer.close().await;
                });
            }
            Err(_) => warn!("Negotiator dropped outside a runtime; peer connection left open"),
        }
    }
}

impl ConnectionNegotiator {
    /// Create a negotiator; nothing is sent until [`start`](Self::start)
    pub fn new(
        role: Role,
        room_id: RoomId,
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        link: impl SignalLink + 'static,
        status: TransferStateMachine,
    ) -> Self {
        let release = ReleaseOnDrop {
            peer: peer.clone(),
            channel: None,
            armed: true,
        };
        Self {
            role,
            room_id,
            peer,
            events,
            link: Box::new(link),
            status,
            channel: None,
            pending: Vec::new(),
            connected: false,
            cleaned_up: false,
            release,
        }
    }

    /// Role of this side
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.status.status()
    }

    /// Whether the direct channel is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Enter `waiting` and join the room.
    ///
    /// The sender opens its local channel here, before any description exists.
    ///
    /// # Errors
    ///
    /// Returns error if the status is not `idle`, the channel cannot be
    /// created, or the link is closed.
    pub async fn start(&mut self) -> Result<()> {
        self.status.transition(TransferStatus::Waiting)?;
        if self.role == Role::Sender {
            let channel = self.peer.create_data_channel(CHANNEL_LABEL).await?;
            self.release.channel = Some(channel.clone());
            self.channel = Some(channel);
        }
        self.link
            .send(ClientMessage::JoinRoom {
                room_id: self.room_id.clone(),
            })
            .await?;
        info!("Joined room {} as {}", self.room_id, self.role);
        Ok(())
    }

    /// Apply one message from the relay.
    ///
    /// # Errors
    ///
    /// Returns the relay's rejection as a [`NegotiationError`], or a platform
    /// error while generating or applying descriptions. Candidate failures are
    /// not errors.
    pub async fn handle_signal(&mut self, message: ServerMessage) -> Result<()> {
        match (message, self.role) {
            (ServerMessage::UserJoined, Role::Sender) => {
                debug!("Peer joined, sending offer");
                let offer = self.peer.create_offer().await?;
                self.peer.set_local_description(offer.clone()).await?;
                self.link
                    .send(ClientMessage::Offer {
                        sdp: to_value(&offer)?,
                    })
                    .await?;
            }
            (ServerMessage::Offer { sdp }, Role::Receiver) => {
                let offer = description(sdp, SdpKind::Offer)?;
                self.peer.set_remote_description(offer).await?;
                let answer = self.peer.create_answer().await?;
                self.peer.set_local_description(answer.clone()).await?;
                self.link
                    .send(ClientMessage::Answer {
                        sdp: to_value(&answer)?,
                    })
                    .await?;
                debug!("Answer sent");
            }
            (ServerMessage::Answer { sdp }, Role::Sender) => {
                let answer = description(sdp, SdpKind::Answer)?;
                self.peer.set_remote_description(answer).await?;
                debug!("Answer applied");
            }
            (ServerMessage::IceCandidate { candidate }, _) => {
                let applied = match serde_json::from_value::<IceCandidate>(candidate) {
                    Ok(candidate) => self.peer.add_ice_candidate(candidate).await,
                    Err(e) => Err(TransportError::InvalidCandidate(e.to_string())),
                };
                if let Err(e) = applied {
                    debug!("Ignoring candidate: {}", e);
                }
            }
            (ServerMessage::ErrorMessage { code, message }, _) => {
                warn!("Relay rejected {}: {}", self.role, message);
                self.status.fail();
                return Err(rejection(code, message).into());
            }
            (ServerMessage::UserLeft, _) => {
                info!("Peer left room {} before connecting", self.room_id);
            }
            (message, role) => {
                debug!("Ignoring {} as {}", message.message_type(), role);
            }
        }
        Ok(())
    }

    /// Apply one event from the host platform.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::ConnectionLost`] when the connection fails
    /// or the channel closes.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let candidate = serde_json::to_value(&candidate)
                    .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;
                self.link
                    .send(ClientMessage::IceCandidate { candidate })
                    .await?;
            }
            PeerEvent::DataChannel(channel) => {
                debug!("Remote opened channel {:?}", channel.label());
                let open = channel.is_open();
                self.release.channel = Some(channel.clone());
                self.channel = Some(channel);
                if open {
                    self.mark_connected()?;
                }
            }
            PeerEvent::ChannelOpen => {
                if self.channel.is_some() && !self.connected {
                    self.mark_connected()?;
                }
            }
            PeerEvent::ChannelMessage(message) => self.pending.push(message),
            PeerEvent::ConnectionState(state) if state.is_lost() => {
                warn!("Connection {:?} during negotiation", state);
                self.status.fail();
                return Err(NegotiationError::ConnectionLost.into());
            }
            PeerEvent::ConnectionState(state) => debug!("Connection {:?}", state),
            PeerEvent::ChannelClosed => {
                warn!("Channel closed during negotiation");
                self.status.fail();
                return Err(NegotiationError::ConnectionLost.into());
            }
        }
        Ok(())
    }

    fn mark_connected(&mut self) -> Result<()> {
        self.status.transition(TransferStatus::Connected)?;
        self.connected = true;
        info!("Direct channel open in room {}", self.room_id);
        Ok(())
    }

    /// Run the exchange until the channel opens.
    ///
    /// Starts the negotiation first if [`start`](Self::start) was not called.
    /// On failure everything is released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first relay rejection, platform failure or connection loss.
    pub async fn connect(mut self) -> Result<PeerSession> {
        match self.drive().await {
            Ok(()) => self.into_session().await,
            Err(e) => {
                self.status.fail();
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        if self.status.status() == TransferStatus::Idle {
            self.start().await?;
        }

        while !self.connected {
            let input = tokio::select! {
                message = self.link.recv() => Input::Signal(message),
                event = self.events.recv() => Input::Peer(event),
            };
            match input {
                Input::Signal(Some(message)) => self.handle_signal(message).await?,
                Input::Signal(None) => return Err(NegotiationError::SignalingClosed.into()),
                Input::Peer(Some(event)) => self.handle_peer_event(event).await?,
                Input::Peer(None) => return Err(NegotiationError::ConnectionLost.into()),
            }
        }
        Ok(())
    }

    async fn into_session(mut self) -> Result<PeerSession> {
        let Some(channel) = self.channel.take() else {
            self.cleanup().await;
            return Err(NegotiationError::ConnectionLost.into());
        };
        // The session owns the peer from here on
        self.release.armed = false;
        Ok(PeerSession::new(
            self.role,
            channel,
            self.peer,
            self.events,
            self.link,
            self.status,
            self.pending,
        ))
    }

    /// Release the channel, the peer connection and the signaling link.
    ///
    /// Idempotent.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.release.armed = false;
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.peer.close().await;
        self.link.close().await;
        debug!("Negotiation in room {} cleaned up", self.room_id);
    }
}

fn to_value(desc: &SessionDescription) -> Result<Value> {
    serde_json::to_value(desc).map_err(|e| TransportError::Negotiation(e.to_string()).into())
}

fn description(sdp: Value, expected: SdpKind) -> Result<SessionDescription> {
    let desc: SessionDescription = serde_json::from_value(sdp)
        .map_err(|e| Error::from(TransportError::Negotiation(e.to_string())))?;
    if desc.kind != expected {
        return Err(TransportError::Negotiation(format!(
            "expected {expected:?}, got {:?}",
            desc.kind
        ))
        .into());
    }
    Ok(desc)
}

fn rejection(code: ErrorCode, message: String) -> NegotiationError {
    match code {
        ErrorCode::RoomNotFound => NegotiationError::RoomNotFound,
        ErrorCode::RoomFull => NegotiationError::RoomFull,
        ErrorCode::RoomExpired => NegotiationError::RoomExpired,
        ErrorCode::ServerFull | ErrorCode::InvalidMessage => NegotiationError::Relay(message),
    }
}
