//! # huddle-client
//!
//! The room session client: one local participant's view of a room. Handles:
//! - Joining/leaving a room through the signaling relay
//! - One peer connection per remote participant, negotiated independently
//! - Offer/answer/ICE exchange relayed through the signaling WebSocket
//! - Capability toggles (audio/video/screen share) fanned out as track
//!   replacements plus a `participant-update` broadcast
//! - Relay reconnection with backoff; peer state is discarded and the room is
//!   re-joined from scratch
//!
//! The actual media engine sits behind the [`engine::PeerConnector`] seam;
//! [`rtc::WebRtcConnector`] is the production implementation backed by
//! webrtc-rs. Device capture (cameras, microphones, screen grabs) is the
//! embedding application's concern; it writes samples into the connector's
//! local tracks.

pub mod engine;
pub mod error;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use engine::{MediaIntent, PeerConnector, PeerEvent, PeerLink, VideoFeed};
pub use error::{ClientError, Result};
pub use session::{PeerPhase, RoomSession, SessionConfig, SessionEvent};
pub use signaling::{LinkEvent, RelayLink};
