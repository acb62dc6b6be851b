//! Wire protocol between the room session client and the signaling relay.
//!
//! Every event rides a single JSON envelope `{"event": ..., "data": ...}` on
//! one WebSocket per client. The two directions are separate enums so each
//! side dispatches on exactly the events it can legally receive:
//!
//! - [`ClientEvent`]: client to relay (join/leave, signal, flag updates, chat)
//! - [`ServerEvent`]: relay to client (roster, presence, relayed signals)
//!
//! The relay is payload-agnostic for [`SignalMessage::data`]: it routes by
//! `to` within `room_id` and never parses the SDP/ICE payload.

use crate::model::{ChatBroadcast, Participant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of handshake payload a [`SignalMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Envelope for one hop of the offer/answer/ICE exchange.
///
/// Delivery is best-effort and at-most-once: if the recipient is gone the
/// message is dropped, and the handshake above this layer must tolerate the
/// loss (further ICE candidates keep trickling; connectivity checks retry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Opaque SDP or ICE-candidate payload. Never interpreted by the relay.
    pub data: serde_json::Value,
    pub from: String,
    pub to: String,
    pub room_id: String,
}

/// Events the client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join a room, implicitly creating it. Re-joining under an id already
    /// present is a state refresh (last write wins), not an error.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        participant: Participant,
    },

    /// Leave a room. Also triggered implicitly when the connection drops.
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String, user_id: String },

    /// Relay a handshake message to one recipient in the room.
    Signal(SignalMessage),

    /// Broadcast a capability-flag change (video/audio/screen share).
    #[serde(rename_all = "camelCase")]
    ParticipantUpdate {
        room_id: String,
        participant: Participant,
    },

    /// Advisory speaking-indicator change.
    #[serde(rename_all = "camelCase")]
    Talking {
        room_id: String,
        user_id: String,
        is_talking: bool,
    },

    /// Room-wide chat message. Echoed back to the sender by the relay.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        user_id: String,
        user_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Events the relay sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once to the joiner, immediately after `join-room`: the current
    /// roster of the room, excluding the joiner. May be empty.
    ExistingParticipants(Vec<Participant>),

    /// Someone else joined the room.
    ParticipantJoined(Participant),

    /// Someone left the room (explicitly or by disconnect). Payload is the
    /// participant id.
    ParticipantLeft(String),

    /// A handshake message addressed to this client.
    Signal(SignalMessage),

    /// Someone else's capability flags changed.
    ParticipantUpdated(Participant),

    /// Someone's speaking indicator changed.
    #[serde(rename_all = "camelCase")]
    Talking {
        room_id: String,
        user_id: String,
        is_talking: bool,
    },

    /// A chat message, fanned out to the whole room including the sender.
    ChatMessage(ChatBroadcast),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_envelope() {
        let event = ClientEvent::JoinRoom {
            room_id: "r1".into(),
            participant: Participant::silent("u1", "Alice"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "join-room");
        assert_eq!(json["data"]["roomId"], "r1");
        assert_eq!(json["data"]["participant"]["id"], "u1");
    }

    #[test]
    fn signal_envelope_round_trips_opaque_data() {
        let wire = json!({
            "event": "signal",
            "data": {
                "type": "ice-candidate",
                "data": {"candidate": "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host"},
                "from": "a",
                "to": "b",
                "roomId": "r1",
            }
        });
        let event: ClientEvent = serde_json::from_value(wire.clone()).unwrap();
        let ClientEvent::Signal(msg) = &event else {
            panic!("expected signal");
        };
        assert_eq!(msg.kind, SignalKind::IceCandidate);
        assert_eq!(msg.room_id, "r1");
        // Payload survives untouched
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn participant_left_is_a_bare_id() {
        let event = ServerEvent::ParticipantLeft("u2".into());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "participant-left");
        assert_eq!(json["data"], "u2");
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        let wire = json!({"event": "shutdown-relay", "data": null});
        assert!(serde_json::from_value::<ClientEvent>(wire).is_err());
    }
}
