//! An established transfer session over the direct channel.
//!
//! A background watcher owns the peer events and the signaling link for the
//! life of the session. It queues channel messages for [`PeerSession::receive`],
//! applies late candidates in both directions, and fails the status as soon as
//! the connection is lost, whether or not a batch is in flight.

use crate::error::{Error, Result, TransferError};
use crate::negotiator::Role;
use crate::signal::SignalLink;
use crate::state::{TransferStateMachine, TransferStatus};
use crate::transfer::{
    BatchSummary, OutgoingFile, ProgressEvent, ReceiveEvent, ReceivedFile, TransferConfig,
    TransferReceiver, TransferSender, batch_size,
};
use crate::transport::{
    ChannelMessage, DataChannel, IceCandidate, PeerConnection, PeerEvent, PeerEvents,
};
use roomlink_relay::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the watcher hands to the session
#[derive(Debug)]
enum Inbound {
    Message(ChannelMessage),
    Lost(String),
}

/// Channel, role and status of a connected peer
///
/// Call [`close`](Self::close) when done; it releases the channel, the peer
/// connection and the signaling link. Dropping the session without closing
/// it releases them in the background.
pub struct PeerSession {
    role: Role,
    channel: Arc<dyn DataChannel>,
    status: TransferStateMachine,
    receiver: TransferReceiver,
    pending: Vec<ChannelMessage>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    shutdown: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
    closed: bool,
}

impl PeerSession {
    /// Must be called inside a Tokio runtime; spawns the watcher
    pub(crate) fn new(
        role: Role,
        channel: Arc<dyn DataChannel>,
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        link: Box<dyn SignalLink>,
        status: TransferStateMachine,
        pending: Vec<ChannelMessage>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let watcher = Watcher {
            role,
            channel: channel.clone(),
            peer,
            events,
            link,
            link_open: true,
            status: status.clone(),
            inbox: inbox_tx,
        };
        let watcher = tokio::spawn(watcher.run(shutdown_rx));

        Self {
            role,
            channel,
            status,
            receiver: TransferReceiver::new(),
            pending,
            inbox,
            shutdown: Some(shutdown),
            watcher: Some(watcher),
            closed: false,
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

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    /// The direct channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    /// Receive-side manifest and per-file progress
    #[must_use]
    pub fn receiver(&self) -> &TransferReceiver {
        &self.receiver
    }

    /// Send one batch of files.
    ///
    /// Status moves to `transferring`, then to `done` on success or `error` on
    /// failure. Raising `cancel` aborts the batch.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::NotConnected`] unless the session is
    /// `connected` or `done`; a channel found closed moves the status to
    /// `error`. Returns [`TransferError::SizeLimitExceeded`] with the status
    /// unchanged, and any error of [`TransferSender::send_batch`].
    pub async fn send_files<F>(
        &mut self,
        files: Vec<OutgoingFile>,
        config: &TransferConfig,
        on_progress: F,
        cancel: Arc<AtomicBool>,
    ) -> Result<BatchSummary>
    where
        F: FnMut(ProgressEvent),
    {
        if self.closed {
            return Err(TransferError::NotConnected.into());
        }
        if !self.channel.is_open() {
            warn!("Channel closed before the batch started");
            self.status.fail();
            return Err(TransferError::NotConnected.into());
        }
        // Oversized batches are refused without touching the session
        batch_size(&files, config.max_batch_bytes)?;
        self.status
            .transition(TransferStatus::Transferring)
            .map_err(|_| Error::from(TransferError::NotConnected))?;

        let sender = TransferSender::new(self.channel.clone(), config.clone()).with_cancel(cancel);
        match sender.send_batch(files, on_progress).await {
            Ok(summary) => {
                self.status.transition(TransferStatus::Done)?;
                info!("Sent {} file(s), {} bytes", summary.files, summary.bytes);
                Ok(summary)
            }
            Err(e) => {
                warn!("Batch failed: {}", e);
                self.status.fail();
                Err(e.into())
            }
        }
    }

    /// Receive until the peer's `transfer-complete`.
    ///
    /// `on_event` sees every [`ReceiveEvent`] in order, including protocol
    /// violations, which are otherwise ignored. Returns the files of the batch.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ConnectionLost`] if the connection fails or the
    /// channel closes first; files received so far are dropped with the batch.
    pub async fn receive<F>(&mut self, mut on_event: F) -> Result<Vec<ReceivedFile>>
    where
        F: FnMut(&ReceiveEvent),
    {
        if self.closed {
            return Err(TransferError::NotConnected.into());
        }

        let mut files = Vec::new();
        for message in std::mem::take(&mut self.pending) {
            if self.apply(message, &mut on_event, &mut files)? {
                return Ok(files);
            }
        }

        loop {
            match self.inbox.recv().await {
                Some(Inbound::Message(message)) => {
                    if self.apply(message, &mut on_event, &mut files)? {
                        return Ok(files);
                    }
                }
                Some(Inbound::Lost(reason)) => return Err(self.lost(&reason)),
                None => return Err(self.lost("session watcher stopped")),
            }
        }
    }

    /// Feed one message to the receiver; true once the batch is complete
    fn apply<F>(
        &mut self,
        message: ChannelMessage,
        on_event: &mut F,
        files: &mut Vec<ReceivedFile>,
    ) -> Result<bool>
    where
        F: FnMut(&ReceiveEvent),
    {
        let mut complete = false;
        for event in self.receiver.handle(message) {
            on_event(&event);
            match event {
                ReceiveEvent::Manifest(_) => self.begin_batch()?,
                ReceiveEvent::FileReceived(file) => files.push(file),
                ReceiveEvent::TransferComplete => {
                    self.begin_batch()?;
                    self.status.transition(TransferStatus::Done)?;
                    complete = true;
                }
                ReceiveEvent::Progress(_) | ReceiveEvent::ProtocolViolation(_) => {}
            }
        }
        Ok(complete)
    }

    fn begin_batch(&self) -> Result<()> {
        if self.status.status() != TransferStatus::Transferring {
            self.status.transition(TransferStatus::Transferring)?;
        }
        Ok(())
    }

    fn lost(&self, reason: &str) -> Error {
        debug!("Receive interrupted: {}", reason);
        self.status.fail();
        TransferError::ConnectionLost(reason.to_string()).into()
    }

    /// Release the channel, the peer connection and the signaling link.
    ///
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                warn!("Session watcher ended abnormally: {}", e);
            }
        }
        debug!("Session closed as {}", self.role);
    }
}

// ============================================================================
// Watcher
// ============================================================================

enum Input {
    Shutdown,
    Peer(Option<PeerEvent>),
    Signal(Option<ServerMessage>),
}

/// Owns everything the session does not touch directly
struct Watcher {
    role: Role,
    channel: Arc<dyn DataChannel>,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    link: Box<dyn SignalLink>,
    link_open: bool,
    status: TransferStateMachine,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl Watcher {
    /// Runs until the connection is lost or the session closes or drops
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let input = tokio::select! {
                _ = &mut shutdown => Input::Shutdown,
                event = self.events.recv() => Input::Peer(event),
                message = self.link.recv(), if self.link_open => Input::Signal(message),
            };
            let keep_going = match input {
                Input::Shutdown => false,
                Input::Peer(Some(event)) => self.on_peer_event(event).await,
                Input::Peer(None) => {
                    self.lost("event stream ended");
                    false
                }
                Input::Signal(Some(message)) => {
                    self.on_signal(message).await;
                    true
                }
                Input::Signal(None) => {
                    debug!("Signaling link closed under the {} session", self.role);
                    self.link_open = false;
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        self.channel.close().await;
        self.peer.close().await;
        self.link.close().await;
        debug!("Session watcher for {} stopped", self.role);
    }

    /// Handle one peer event; false once the connection is gone
    async fn on_peer_event(&mut self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::ChannelMessage(message) => {
                let _ = self.inbox.send(Inbound::Message(message));
                true
            }
            PeerEvent::ConnectionState(state) if state.is_lost() => {
                self.lost(&format!("connection {state:?}"));
                false
            }
            PeerEvent::ChannelClosed => {
                self.lost("channel closed");
                false
            }
            PeerEvent::IceCandidate(candidate) => {
                self.forward_candidate(&candidate).await;
                true
            }
            other => {
                debug!("Ignoring {:?} on an established session", other);
                true
            }
        }
    }

    async fn on_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::IceCandidate { candidate } => {
                match serde_json::from_value::<IceCandidate>(candidate) {
                    Ok(candidate) => {
                        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                            debug!("Ignoring late remote candidate: {}", e);
                        }
                    }
                    Err(e) => debug!("Ignoring malformed late candidate: {}", e),
                }
            }
            ServerMessage::UserLeft => info!("Peer left the signaling room"),
            ServerMessage::ErrorMessage { code, message } => {
                info!("Relay reported {:?}: {}", code, message);
            }
            other => debug!("Ignoring late {}", other.message_type()),
        }
    }

    async fn forward_candidate(&mut self, candidate: &IceCandidate) {
        if !self.link_open {
            return;
        }
        let Ok(candidate) = serde_json::to_value(candidate) else {
            return;
        };
        if let Err(e) = self.link.send(ClientMessage::IceCandidate { candidate }).await {
            debug!("Late local candidate not delivered: {}", e);
        }
    }

    fn lost(&self, reason: &str) {
        warn!("{} session lost the connection: {}", self.role, reason);
        self.status.fail();
        let _ = self.inbox.send(Inbound::Lost(reason.to_string()));
    }
}
