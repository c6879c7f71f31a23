//! Room registry: two-slot pairing records keyed by room identifier.
//!
//! The registry is plain state with no I/O. All mutation goes through the
//! relay dispatcher, which processes one message at a time, so no locking is
//! done here.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Maximum number of participants a room can hold
pub const MAX_PARTICIPANTS: usize = 2;

/// Smallest accepted number of random bytes in a generated room id
pub const MIN_ROOM_ID_BYTES: usize = 8;

/// Default number of random bytes in a generated room id (24 hex chars)
pub const DEFAULT_ROOM_ID_BYTES: usize = 12;

/// Opaque room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier from the OS CSPRNG.
    ///
    /// `bytes` is raised to [`MIN_ROOM_ID_BYTES`] if smaller.
    #[must_use]
    pub fn generate(bytes: usize) -> Self {
        let mut buf = vec![0u8; bytes.max(MIN_ROOM_ID_BYTES)];
        OsRng.fill_bytes(&mut buf);
        Self(hex::encode(buf))
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one live relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Create from a raw connection counter value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw connection counter value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Room {
    /// Join order is preserved
    participants: Vec<ParticipantId>,
    created_at: Instant,
}

impl Room {
    fn new(created_at: Instant) -> Self {
        Self {
            participants: Vec::with_capacity(MAX_PARTICIPANTS),
            created_at,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Mapping of room identifiers to their participant sets
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty room.
    ///
    /// Re-creating an existing id resets it to empty.
    pub fn create(&mut self, room_id: RoomId) {
        self.create_at(room_id, Instant::now());
    }

    /// Register an empty room with an explicit creation instant
    pub fn create_at(&mut self, room_id: RoomId, created_at: Instant) {
        self.rooms.insert(room_id, Room::new(created_at));
    }

    /// Add a participant to a room.
    ///
    /// Returns `false` if the room does not exist or already holds
    /// [`MAX_PARTICIPANTS`]. Joining a room the participant is already in
    /// succeeds without adding a duplicate.
    pub fn join(&mut self, room_id: &RoomId, participant: ParticipantId) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };

        if room.participants.contains(&participant) {
            return true;
        }

        if room.participants.len() >= MAX_PARTICIPANTS {
            return false;
        }

        room.participants.push(participant);
        true
    }

    /// Remove a participant; deletes the room once it becomes empty.
    ///
    /// Unknown rooms and participants are ignored.
    pub fn leave(&mut self, room_id: &RoomId, participant: ParticipantId) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };

        let before = room.participants.len();
        room.participants.retain(|p| *p != participant);

        if before != room.participants.len() && room.participants.is_empty() {
            self.rooms.remove(room_id);
        }
    }

    /// Check whether a room exists
    #[must_use]
    pub fn exists(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Participants of a room in join order (empty for unknown rooms)
    #[must_use]
    pub fn participants(&self, room_id: &RoomId) -> &[ParticipantId] {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.as_slice())
            .unwrap_or(&[])
    }

    /// Participants of a room other than `participant`
    #[must_use]
    pub fn others(&self, room_id: &RoomId, participant: ParticipantId) -> Vec<ParticipantId> {
        self.participants(room_id)
            .iter()
            .copied()
            .filter(|p| *p != participant)
            .collect()
    }

    /// Check whether a room has outlived `ttl` at `now`
    #[must_use]
    pub fn is_expired(&self, room_id: &RoomId, now: Instant, ttl: Duration) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.is_expired(now, ttl))
    }

    /// Delete every room older than `ttl`.
    ///
    /// Returns each removed room with the participants it still held.
    pub fn purge_expired(
        &mut self,
        now: Instant,
        ttl: Duration,
    ) -> Vec<(RoomId, Vec<ParticipantId>)> {
        let expired: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.is_expired(now, ttl))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.rooms.remove(&id).map(|room| (id, room.participants)))
            .collect()
    }

    /// Number of live rooms
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether no rooms are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
