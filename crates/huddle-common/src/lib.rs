//! # huddle-common
//!
//! Shared types, wire protocol, error handling, and configuration used by the
//! Huddle relay and client crates. This is the foundation layer: no business
//! logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod model;
pub mod protocol;

pub use error::{HuddleError, HuddleResult};
pub use model::{ChatBroadcast, Participant};
pub use protocol::{ClientEvent, ServerEvent, SignalKind, SignalMessage};
