//! Core data model: participants and chat messages.
//!
//! Field names are serialized in camelCase because they are shared with
//! browser clients; the wire shapes here are the contract, not an internal
//! detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user's presence within a room.
///
/// The `id` is chosen by the caller and must be stable for the lifetime of the
/// browser/app session. The capability flags describe what media the
/// participant is currently publishing; they are advisory state mirrored to
/// every other member of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_screen_sharing: bool,
    pub is_video_on: bool,
    pub is_audio_on: bool,
}

impl Participant {
    /// A participant with all capabilities off. Used when joining without
    /// local media (media acquisition failure must not prevent joining).
    pub fn silent(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            is_screen_sharing: false,
            is_video_on: false,
            is_audio_on: false,
        }
    }

    /// Overwrite the capability flags from another snapshot of the same
    /// participant. Identity fields (`id`, `name`) are kept.
    pub fn apply_flags(&mut self, update: &Participant) {
        self.is_screen_sharing = update.is_screen_sharing;
        self.is_video_on = update.is_video_on;
        self.is_audio_on = update.is_audio_on;
        if update.avatar.is_some() {
            self.avatar = update.avatar.clone();
        }
    }
}

/// A chat message as fanned out by the relay.
///
/// The `id` is assigned server-side when the message is broadcast; the relay
/// keeps no history, so the id only needs to be unique, not ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
