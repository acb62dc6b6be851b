//! The peer-engine seam.
//!
//! The session state machine in [`crate::session`] owns *who* it is connected
//! to and *when* handshake messages flow; the engine owns *how* a single peer
//! connection negotiates and carries media. Splitting the two behind these
//! traits keeps the control plane testable without a real WebRTC stack and
//! keeps all webrtc-rs specifics inside [`crate::rtc`].

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque SDP or ICE payload, relayed verbatim through the signaling channel.
pub type SignalPayload = serde_json::Value;

/// What the local video sender is currently carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFeed {
    Off,
    Camera,
    Screen,
}

/// The local media the session wants attached to a new peer connection.
///
/// Initial track attachment at connection-creation time already reflects the
/// current capability flags, which is why capability toggles can treat
/// not-yet-created peers as no-ops.
#[derive(Debug, Clone, Copy)]
pub struct MediaIntent {
    pub audio: bool,
    pub video: VideoFeed,
}

/// Events a peer connection pushes back to the session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate, to be trickled to the remote peer.
    IceCandidate(SignalPayload),
    /// The transport reached a connected state; media is flowing.
    Connected,
    /// The transport failed or closed underneath us.
    Failed,
}

/// An engine event tagged with the remote participant it belongs to.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub remote_id: String,
    pub event: PeerEvent,
}

/// Creates peer connections. One connector is shared by the whole session;
/// all connections it creates publish the same local media source.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Create a peer connection toward `remote_id`, attach local tracks per
    /// `intent`, and report engine events through `events`.
    async fn connect(
        &self,
        remote_id: &str,
        intent: MediaIntent,
        events: mpsc::Sender<PeerUpdate>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// One negotiated (or negotiating) connection to a single remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create a local offer and return its payload for relaying.
    async fn create_offer(&self) -> Result<SignalPayload>;

    /// Apply a remote offer and return the answer payload.
    async fn accept_offer(&self, offer: SignalPayload) -> Result<SignalPayload>;

    /// Apply the remote answer to a previously sent offer.
    async fn accept_answer(&self, answer: SignalPayload) -> Result<()>;

    /// Add a trickled remote ICE candidate. Candidates may arrive before or
    /// after the answer; order must not be assumed.
    async fn add_ice_candidate(&self, candidate: SignalPayload) -> Result<()>;

    /// Replace the outgoing audio track (enable/disable the microphone feed).
    async fn set_audio(&self, enabled: bool) -> Result<()>;

    /// Replace the outgoing video track (camera, screen capture, or nothing).
    async fn set_video(&self, feed: VideoFeed) -> Result<()>;

    /// Tear the connection down. Irreversible; a future peer relationship
    /// requires a wholly new link.
    async fn close(&self);
}
