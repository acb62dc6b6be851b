//! Error types for the Huddle client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error from the WebRTC engine.
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    /// The relay link was not connected.
    #[error("Relay is not connected")]
    NotConnected,

    /// The session actor has shut down (after leave or a permanent link loss).
    #[error("Session is closed")]
    SessionClosed,

    /// A generic error string.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
