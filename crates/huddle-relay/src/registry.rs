//! Room registry: the authoritative, in-memory membership map.
//!
//! Owned by the relay process; rooms are created implicitly on first join and
//! discarded when the last participant leaves, so a room emptied by leaves is
//! indistinguishable from one that never existed.
//!
//! Every operation takes the registry lock exactly once and performs its
//! membership mutation and the matching fan-out inside that critical section,
//! so no two events for the same room ever observe a partially-applied state.
//! Fan-out uses `try_send` (never awaits under the lock): a client that
//! cannot drain its queue loses events rather than stalling the room.

use huddle_common::model::{ChatBroadcast, Participant};
use huddle_common::protocol::{ServerEvent, SignalMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One registered member of a room.
struct RoomMember {
    participant: Participant,
    /// The transport association recorded at join time. A re-join under the
    /// same participant id replaces this, and cleanup for the old connection
    /// then no-ops instead of evicting the new registration.
    connection_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

/// A live room. Exists only while it has members.
#[derive(Default)]
struct Room {
    /// Keyed by participant id, so no duplicate ids by construction.
    members: HashMap<String, RoomMember>,
}

impl Room {
    /// Send an event to every member except `exclude` (the originator).
    fn broadcast(&self, event: &ServerEvent, exclude: Option<&str>) {
        for (id, member) in &self.members {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if member.tx.try_send(event.clone()).is_err() {
                tracing::warn!(user = %id, "Dropping event for slow or gone client");
            }
        }
    }
}

/// Live room/participant counts.
#[derive(Debug, serde::Serialize)]
pub struct RelayStats {
    pub active_rooms: usize,
    pub total_participants: usize,
}

/// The relay's single source of truth for live room membership.
///
/// No ambient global state: the registry is an explicit object owned by
/// [`crate::RelayState`] and handed to each connection.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant in a room, creating the room if absent.
    ///
    /// Returns the current roster excluding the joiner, as a single batch for
    /// the `existing-participants` reply. Everyone already present is sent
    /// `participant-joined` exactly once.
    ///
    /// Joining under an id already present is a refresh, not an error: the
    /// stored participant and transport association are overwritten (last
    /// write wins) and the room still announces the join.
    pub async fn join(
        &self,
        room_id: &str,
        participant: Participant,
        connection_id: Uuid,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Vec<Participant> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_owned()).or_default();

        let joiner_id = participant.id.clone();
        let roster: Vec<Participant> = room
            .members
            .iter()
            .filter(|(id, _)| **id != joiner_id)
            .map(|(_, m)| m.participant.clone())
            .collect();

        room.broadcast(
            &ServerEvent::ParticipantJoined(participant.clone()),
            Some(&joiner_id),
        );

        let replaced = room
            .members
            .insert(
                joiner_id.clone(),
                RoomMember {
                    participant,
                    connection_id,
                    tx,
                },
            )
            .is_some();

        tracing::info!(
            room = %room_id,
            user = %joiner_id,
            rejoin = replaced,
            size = room.members.len(),
            "Participant joined room"
        );

        roster
    }

    /// Remove a participant and announce `participant-left` to the remainder.
    ///
    /// Idempotent: absent rooms or participants are a silent no-op. The
    /// removal only applies when `connection_id` still matches the recorded
    /// association, so a stale connection's cleanup (explicit leave or
    /// disconnect) cannot evict a registration that a newer connection took
    /// over. Returns whether a removal (and broadcast) happened.
    pub async fn leave(&self, room_id: &str, user_id: &str, connection_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        match room.members.get(user_id) {
            Some(member) if member.connection_id == connection_id => {}
            _ => return false,
        }
        room.members.remove(user_id);

        room.broadcast(&ServerEvent::ParticipantLeft(user_id.to_owned()), None);

        tracing::info!(room = %room_id, user = %user_id, size = room.members.len(), "Participant left room");

        if room.members.is_empty() {
            rooms.remove(room_id);
            tracing::debug!(room = %room_id, "Room emptied and discarded");
        }
        true
    }

    /// Forward a handshake message to its addressee, verbatim.
    ///
    /// Returns `false` when the recipient is not currently registered in the
    /// room (e.g. the message raced with a leave); the message is then
    /// silently dropped, never delivered to anyone else.
    pub async fn forward_signal(&self, message: SignalMessage) -> bool {
        let rooms = self.rooms.read().await;
        let Some(member) = rooms
            .get(&message.room_id)
            .and_then(|room| room.members.get(&message.to))
        else {
            tracing::debug!(
                room = %message.room_id,
                to = %message.to,
                kind = ?message.kind,
                "Dropping signal for absent recipient"
            );
            return false;
        };
        member.tx.try_send(ServerEvent::Signal(message)).is_ok()
    }

    /// Apply a capability-flag change and announce it to the rest of the room.
    ///
    /// The stored roster entry is refreshed too, so participants joining
    /// later see current flags rather than the ones from join time.
    pub async fn update_participant(&self, room_id: &str, update: Participant) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        let Some(member) = room.members.get_mut(&update.id) else {
            return;
        };
        member.participant.apply_flags(&update);
        let current = member.participant.clone();
        room.broadcast(&ServerEvent::ParticipantUpdated(current), Some(&update.id));
    }

    /// Announce a speaking-indicator change. Advisory only; nothing stored.
    pub async fn talking(&self, room_id: &str, user_id: &str, is_talking: bool) {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return;
        };
        room.broadcast(
            &ServerEvent::Talking {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
                is_talking,
            },
            Some(user_id),
        );
    }

    /// Fan a chat message out to the whole room, including the sender, with a
    /// relay-assigned message id. No history is retained.
    pub async fn chat(&self, room_id: &str, message: ChatBroadcast) {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(room_id) else {
            return;
        };
        room.broadcast(&ServerEvent::ChatMessage(message), None);
    }

    /// Current roster of a room. Empty when the room does not exist.
    pub async fn members(&self, room_id: &str) -> Vec<Participant> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.members.values().map(|m| m.participant.clone()).collect())
            .unwrap_or_default()
    }

    /// Live room/participant counts.
    pub async fn stats(&self) -> RelayStats {
        let rooms = self.rooms.read().await;
        RelayStats {
            active_rooms: rooms.len(),
            total_participants: rooms.values().map(|r| r.members.len()).sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
