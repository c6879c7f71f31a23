//! Signaling router built on the room registry.
//!
//! [`SignalingRelay`] turns one inbound event from one connection into the set
//! of outbound [`Delivery`] values it causes. It performs no I/O; the
//! dispatcher owns the sockets and applies the deliveries.

use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::registry::{DEFAULT_ROOM_ID_BYTES, ParticipantId, RoomId, RoomRegistry};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Attempts at drawing an unused room id before giving up
const MAX_ID_ATTEMPTS: usize = 8;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lifetime of a room measured from its creation
    pub room_ttl: Duration,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// Maximum number of live rooms
    pub max_rooms: usize,
    /// Random bytes per generated room id
    pub room_id_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            max_rooms: 10_000,
            room_id_bytes: DEFAULT_ROOM_ID_BYTES,
        }
    }
}

/// A message addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Recipient connection
    pub to: ParticipantId,
    /// Message to deliver
    pub message: ServerMessage,
}

impl Delivery {
    fn new(to: ParticipantId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

/// Per-connection message router
pub struct SignalingRelay {
    registry: RoomRegistry,
    /// Connection -> room it is a member of
    memberships: HashMap<ParticipantId, RoomId>,
    config: RelayConfig,
}

impl SignalingRelay {
    /// Create a relay with its own empty registry
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: RoomRegistry::new(),
            memberships: HashMap::new(),
            config,
        }
    }

    /// Provision a fresh room.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ServerFull`] when `max_rooms` rooms are live or no
    /// unused id could be drawn.
    pub fn create_room(&mut self, now: Instant) -> Result<RoomId, ErrorCode> {
        if self.registry.len() >= self.config.max_rooms {
            return Err(ErrorCode::ServerFull);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let room_id = RoomId::generate(self.config.room_id_bytes);
            if !self.registry.exists(&room_id) {
                self.registry.create_at(room_id.clone(), now);
                info!("Room {} created ({} live)", room_id, self.registry.len());
                return Ok(room_id);
            }
        }

        Err(ErrorCode::ServerFull)
    }

    /// Route one inbound message
    pub fn handle(
        &mut self,
        from: ParticipantId,
        message: ClientMessage,
        now: Instant,
    ) -> Vec<Delivery> {
        match message {
            ClientMessage::CreateRoom => match self.create_room(now) {
                Ok(room_id) => vec![Delivery::new(from, ServerMessage::RoomCreated { room_id })],
                Err(code) => vec![Delivery::new(from, ServerMessage::error(code))],
            },
            ClientMessage::JoinRoom { room_id } => self.join(from, room_id, now),
            ClientMessage::Offer { sdp } => self.forward(from, ServerMessage::Offer { sdp }),
            ClientMessage::Answer { sdp } => self.forward(from, ServerMessage::Answer { sdp }),
            ClientMessage::IceCandidate { candidate } => {
                self.forward(from, ServerMessage::IceCandidate { candidate })
            }
        }
    }

    /// Handle a connection going away
    pub fn disconnect(&mut self, from: ParticipantId) -> Vec<Delivery> {
        match self.memberships.remove(&from) {
            Some(room_id) => self.leave_room(from, &room_id),
            None => Vec::new(),
        }
    }

    /// Delete expired rooms and notify the members they held
    pub fn purge_expired(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        for (room_id, participants) in self.registry.purge_expired(now, self.config.room_ttl) {
            info!("Room {} expired", room_id);
            for participant in participants {
                self.memberships.remove(&participant);
                deliveries.push(Delivery::new(
                    participant,
                    ServerMessage::error(ErrorCode::RoomExpired),
                ));
            }
        }

        deliveries
    }

    /// Room a connection is currently a member of
    #[must_use]
    pub fn room_of(&self, participant: ParticipantId) -> Option<&RoomId> {
        self.memberships.get(&participant)
    }

    /// Read-only view of the registry
    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Relay configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn join(&mut self, from: ParticipantId, room_id: RoomId, now: Instant) -> Vec<Delivery> {
        if self.memberships.get(&from) == Some(&room_id) {
            debug!("{} re-joined room {}", from, room_id);
            return Vec::new();
        }

        if !self.registry.exists(&room_id) {
            debug!("{} joined missing room {}", from, room_id);
            return vec![Delivery::new(from, ServerMessage::error(ErrorCode::RoomNotFound))];
        }

        if self.registry.is_expired(&room_id, now, self.config.room_ttl) {
            debug!("{} joined expired room {}", from, room_id);
            return vec![Delivery::new(from, ServerMessage::error(ErrorCode::RoomExpired))];
        }

        if !self.registry.join(&room_id, from) {
            debug!("{} rejected from full room {}", from, room_id);
            return vec![Delivery::new(from, ServerMessage::error(ErrorCode::RoomFull))];
        }

        let mut deliveries = match self.memberships.insert(from, room_id.clone()) {
            Some(previous) => self.leave_room(from, &previous),
            None => Vec::new(),
        };

        info!("{} joined room {}", from, room_id);
        deliveries.extend(
            self.registry
                .others(&room_id, from)
                .into_iter()
                .map(|to| Delivery::new(to, ServerMessage::UserJoined)),
        );
        deliveries
    }

    fn leave_room(&mut self, from: ParticipantId, room_id: &RoomId) -> Vec<Delivery> {
        let remaining = self.registry.others(room_id, from);
        self.registry.leave(room_id, from);
        info!("{} left room {}", from, room_id);

        remaining
            .into_iter()
            .map(|to| Delivery::new(to, ServerMessage::UserLeft))
            .collect()
    }

    fn forward(&self, from: ParticipantId, message: ServerMessage) -> Vec<Delivery> {
        let Some(room_id) = self.memberships.get(&from) else {
            debug!("Dropping {} from non-member {}", message.message_type(), from);
            return Vec::new();
        };

        debug!("Forwarding {} from {} in room {}", message.message_type(), from, room_id);
        self.registry
            .others(room_id, from)
            .into_iter()
            .map(|to| Delivery::new(to, message.clone()))
            .collect()
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    fn join(room: &RoomId) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room.clone(),
        }
    }

    fn relay_with_room(name: &str) -> (SignalingRelay, RoomId, Instant) {
        let mut relay = SignalingRelay::default();
        let now = Instant::now();
        let room = RoomId::from(name);
        relay.registry.create_at(room.clone(), now);
        (relay, room, now)
    }

    #[test]
    fn test_scenario_room_full() {
        let (mut relay, room, now) = relay_with_room("R1");

        let first = relay.handle(p(1), join(&room), now);
        assert!(first.is_empty());

        let second = relay.handle(p(2), join(&room), now);
        assert_eq!(second, vec![Delivery::new(p(1), ServerMessage::UserJoined)]);

        let third = relay.handle(p(3), join(&room), now);
        assert_eq!(
            third,
            vec![Delivery::new(p(3), ServerMessage::error(ErrorCode::RoomFull))]
        );
        assert_eq!(relay.room_of(p(3)), None);
    }

    #[test]
    fn test_scenario_disconnect_before_peer() {
        let (mut relay, room, now) = relay_with_room("R2");

        relay.handle(p(1), join(&room), now);
        assert!(relay.disconnect(p(1)).is_empty());
        assert!(!relay.registry().exists(&room));

        let late = relay.handle(p(2), join(&room), now);
        assert_eq!(
            late,
            vec![Delivery::new(p(2), ServerMessage::error(ErrorCode::RoomNotFound))]
        );
    }

    #[test]
    fn test_forward_excludes_sender() {
        let (mut relay, room, now) = relay_with_room("R3");
        relay.handle(p(1), join(&room), now);
        relay.handle(p(2), join(&room), now);

        let sdp = json!({"type": "offer", "sdp": "x"});
        let out = relay.handle(p(1), ClientMessage::Offer { sdp: sdp.clone() }, now);
        assert_eq!(out, vec![Delivery::new(p(2), ServerMessage::Offer { sdp })]);

        let candidate = json!({"candidate": "c"});
        let out = relay.handle(
            p(2),
            ClientMessage::IceCandidate {
                candidate: candidate.clone(),
            },
            now,
        );
        assert_eq!(
            out,
            vec![Delivery::new(p(1), ServerMessage::IceCandidate { candidate })]
        );
    }

    #[test]
    fn test_non_member_messages_dropped() {
        let (mut relay, _room, now) = relay_with_room("R4");
        let out = relay.handle(p(7), ClientMessage::Answer { sdp: json!({}) }, now);
        assert!(out.is_empty());
    }

    #[test]
    fn test_disconnect_notifies_remaining_member() {
        let (mut relay, room, now) = relay_with_room("R5");
        relay.handle(p(1), join(&room), now);
        relay.handle(p(2), join(&room), now);

        let out = relay.disconnect(p(2));
        assert_eq!(out, vec![Delivery::new(p(1), ServerMessage::UserLeft)]);
        assert!(relay.registry().exists(&room));
        assert!(relay.disconnect(p(2)).is_empty());
    }

    #[test]
    fn test_rejoin_same_room_is_noop() {
        let (mut relay, room, now) = relay_with_room("R6");
        relay.handle(p(1), join(&room), now);
        relay.handle(p(2), join(&room), now);

        assert!(relay.handle(p(2), join(&room), now).is_empty());
        assert_eq!(relay.registry().participants(&room).len(), 2);
    }

    #[test]
    fn test_join_other_room_leaves_previous() {
        let (mut relay, first, now) = relay_with_room("A");
        let second = RoomId::from("B");
        relay.registry.create_at(second.clone(), now);

        relay.handle(p(1), join(&first), now);
        relay.handle(p(2), join(&first), now);

        let out = relay.handle(p(2), join(&second), now);
        assert_eq!(out, vec![Delivery::new(p(1), ServerMessage::UserLeft)]);
        assert_eq!(relay.room_of(p(2)), Some(&second));
        assert_eq!(relay.registry().participants(&first), &[p(1)]);
    }

    #[test]
    fn test_failed_join_keeps_previous_membership() {
        let (mut relay, first, now) = relay_with_room("A");
        relay.handle(p(1), join(&first), now);

        let out = relay.handle(p(1), join(&RoomId::from("missing")), now);
        assert_eq!(
            out,
            vec![Delivery::new(p(1), ServerMessage::error(ErrorCode::RoomNotFound))]
        );
        assert_eq!(relay.room_of(p(1)), Some(&first));
    }

    #[test]
    fn test_create_room_message() {
        let mut relay = SignalingRelay::default();
        let out = relay.handle(p(1), ClientMessage::CreateRoom, Instant::now());

        assert_eq!(out.len(), 1);
        match &out[0].message {
            ServerMessage::RoomCreated { room_id } => assert!(relay.registry().exists(room_id)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_create_room_respects_capacity() {
        let mut relay = SignalingRelay::new(RelayConfig {
            max_rooms: 1,
            ..RelayConfig::default()
        });
        let now = Instant::now();

        assert!(relay.create_room(now).is_ok());
        assert_eq!(relay.create_room(now), Err(ErrorCode::ServerFull));
    }

    #[test]
    fn test_expired_room_rejects_join() {
        let (mut relay, room, created) = relay_with_room("old");
        let later = created + Duration::from_secs(601);

        let out = relay.handle(p(1), join(&room), later);
        assert_eq!(
            out,
            vec![Delivery::new(p(1), ServerMessage::error(ErrorCode::RoomExpired))]
        );
    }

    #[test]
    fn test_purge_expired_notifies_members() {
        let (mut relay, room, created) = relay_with_room("old");
        relay.handle(p(1), join(&room), created);
        relay.handle(p(2), join(&room), created);

        let mut out = relay.purge_expired(created + Duration::from_secs(600));
        out.sort_by_key(|d| d.to);
        assert_eq!(
            out,
            vec![
                Delivery::new(p(1), ServerMessage::error(ErrorCode::RoomExpired)),
                Delivery::new(p(2), ServerMessage::error(ErrorCode::RoomExpired)),
            ]
        );
        assert!(!relay.registry().exists(&room));
        assert_eq!(relay.room_of(p(1)), None);

        // Members of a purged room can no longer reach each other
        assert!(relay
            .handle(p(1), ClientMessage::Offer { sdp: json!({}) }, created)
            .is_empty());
    }
}
