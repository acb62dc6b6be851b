//! Centralized error types for Huddle.
//!
//! Uses `thiserror` for ergonomic error definitions. The relay deliberately
//! has very few error paths: membership lookups that miss are silent no-ops
//! by design, so most variants here belong to configuration and transport.

use thiserror::Error;

/// Core error type shared by the relay and server crates.
#[derive(Debug, Error)]
pub enum HuddleError {
    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded or was invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A client sent an event that does not parse as part of the protocol.
    /// Never fatal; one client's malformed event must not affect others.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for Results using [`HuddleError`].
pub type HuddleResult<T> = Result<T, HuddleError>;
