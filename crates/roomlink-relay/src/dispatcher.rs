//! Single-task dispatcher that serializes every registry mutation.
//!
//! Connections never touch the [`SignalingRelay`] directly: they submit
//! commands through a [`RelayHandle`] and the dispatcher applies them one at a
//! time, then hands the resulting deliveries to each recipient's outbound
//! queue. The expiry sweep runs on the same task.

use crate::protocol::{ClientMessage, ErrorCode, RelayError, ServerMessage};
use crate::registry::{ParticipantId, RoomId};
use crate::relay::{Delivery, RelayConfig, SignalingRelay};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Outbound queue of one connection
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Inbound queue of one connection
pub type Inbound = mpsc::UnboundedReceiver<ServerMessage>;

enum Command {
    Connect {
        outbound: Outbound,
        reply: oneshot::Sender<ParticipantId>,
    },
    Message {
        from: ParticipantId,
        message: ClientMessage,
    },
    Reject {
        from: ParticipantId,
        code: ErrorCode,
    },
    Disconnect {
        from: ParticipantId,
    },
    CreateRoom {
        reply: oneshot::Sender<Result<RoomId, ErrorCode>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// Snapshot of relay occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Live rooms
    pub rooms: usize,
    /// Live connections
    pub connections: usize,
}

/// Cloneable handle for submitting work to the dispatcher
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// Start a dispatcher task on the current tokio runtime
    #[must_use]
    pub fn spawn(config: RelayConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = RelayDispatcher::new(SignalingRelay::new(config), rx);
        tokio::spawn(dispatcher.run());
        Self { tx }
    }

    /// Register a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DispatcherClosed`] if the dispatcher has stopped.
    pub async fn connect(&self) -> Result<RelayConnection, RelayError> {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Connect { outbound, reply })?;
        let id = rx.await.map_err(|_| RelayError::DispatcherClosed)?;

        Ok(RelayConnection {
            sender: RelaySender {
                id,
                handle: self.clone(),
            },
            inbound,
        })
    }

    /// Provision a fresh room.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Rejected`] when the relay is at capacity.
    pub async fn create_room(&self) -> Result<RoomId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::CreateRoom { reply })?;
        rx.await
            .map_err(|_| RelayError::DispatcherClosed)?
            .map_err(RelayError::Rejected)
    }

    /// Current occupancy.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DispatcherClosed`] if the dispatcher has stopped.
    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Stats { reply })?;
        rx.await.map_err(|_| RelayError::DispatcherClosed)
    }

    fn submit(&self, command: Command) -> Result<(), RelayError> {
        self.tx
            .send(command)
            .map_err(|_| RelayError::DispatcherClosed)
    }
}

/// Sending half of a registered connection.
///
/// Dropping it disconnects the connection, which leaves its room.
pub struct RelaySender {
    id: ParticipantId,
    handle: RelayHandle,
}

impl RelaySender {
    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Submit a client message.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DispatcherClosed`] if the dispatcher has stopped.
    pub fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.handle.submit(Command::Message {
            from: self.id,
            message,
        })
    }

    /// Ask the dispatcher to answer this connection with an error
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DispatcherClosed`] if the dispatcher has stopped.
    pub fn reject(&self, code: ErrorCode) -> Result<(), RelayError> {
        self.handle.submit(Command::Reject { from: self.id, code })
    }
}

impl Drop for RelaySender {
    fn drop(&mut self) {
        let _ = self.handle.submit(Command::Disconnect { from: self.id });
    }
}

/// A registered connection: its sender plus the queue of messages for it
pub struct RelayConnection {
    sender: RelaySender,
    inbound: Inbound,
}

impl RelayConnection {
    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.sender.id
    }

    /// Submit a client message.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DispatcherClosed`] if the dispatcher has stopped.
    pub fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.sender.send(message)
    }

    /// Receive the next message for this connection
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    /// Receive without waiting
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.inbound.try_recv().ok()
    }

    /// Split into independently owned halves
    #[must_use]
    pub fn into_parts(self) -> (RelaySender, Inbound) {
        (self.sender, self.inbound)
    }
}

struct RelayDispatcher {
    relay: SignalingRelay,
    connections: HashMap<ParticipantId, Outbound>,
    next_id: u64,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl RelayDispatcher {
    fn new(relay: SignalingRelay, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            relay,
            connections: HashMap::new(),
            next_id: 1,
            commands,
        }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.relay.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = sweep.tick() => {
                    let deliveries = self.relay.purge_expired(Instant::now());
                    self.deliver(deliveries);
                }
            }
        }

        info!("Relay dispatcher stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Connect { outbound, reply } => {
                let id = ParticipantId::new(self.next_id);
                self.next_id += 1;
                self.connections.insert(id, outbound);
                debug!("{} connected ({} live)", id, self.connections.len());
                let _ = reply.send(id);
            }
            Command::Message { from, message } => {
                let deliveries = self.relay.handle(from, message, Instant::now());
                self.deliver(deliveries);
            }
            Command::Reject { from, code } => {
                self.deliver(vec![Delivery {
                    to: from,
                    message: ServerMessage::error(code),
                }]);
            }
            Command::Disconnect { from } => {
                let deliveries = self.relay.disconnect(from);
                self.connections.remove(&from);
                debug!("{} disconnected ({} live)", from, self.connections.len());
                self.deliver(deliveries);
            }
            Command::CreateRoom { reply } => {
                let _ = reply.send(self.relay.create_room(Instant::now()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(RelayStats {
                    rooms: self.relay.registry().len(),
                    connections: self.connections.len(),
                });
            }
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            if let Some(outbound) = self.connections.get(&to) {
                let _ = outbound.send(message);
            }
        }
    }
}
