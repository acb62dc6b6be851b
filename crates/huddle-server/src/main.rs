//! # Huddle Server
//!
//! Binary that runs the signaling relay:
//! - WebSocket signaling + room membership (`/ws`)
//! - Live stats endpoint (`/stats`)
//!
//! The relay is stateless across restarts. Clients reconnect and re-join
//! their rooms; no persistence layer is involved.

use huddle_relay::RelayState;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = huddle_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Huddle relay v{}", env!("CARGO_PKG_VERSION"));

    let state = RelayState::new(config.relay.clone());
    let router = huddle_relay::build_router(state);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Signaling relay listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
