//! # huddle-relay
//!
//! The signaling relay and room-membership coordinator. Handles:
//! - Room join/leave with implicit room creation and presence fan-out
//! - Relaying offer/answer/ICE-candidate messages by recipient
//! - Capability-flag updates, speaking indicators, and room chat
//! - Disconnect detection (a dropped connection is treated as a leave)
//!
//! The relay performs no media processing and stores no durable state:
//! restarting it drops all room state, which is acceptable because rooms are
//! ephemeral meeting sessions. Media flows directly between peers; only the
//! control-plane handshake passes through here.

pub mod handler;
pub mod registry;

use axum::{routing::get, Json, Router};
use huddle_common::config::RelayConfig;
use registry::RoomRegistry;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Relay state shared across all client connections.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry>,
    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            config,
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

/// Build the relay router: the signaling WebSocket plus a stats endpoint.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(handler::ws_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Live room/participant counts, for dashboards and smoke tests.
async fn stats_handler(
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> Json<registry::RelayStats> {
    Json(state.registry.stats().await)
}
