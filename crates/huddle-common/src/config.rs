//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call huddle_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 4000)?
        .set_default("relay.send_buffer", 256)?
        .set_default("relay.max_event_bytes", 65_536)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HUDDLE__SERVER__HOST, HUDDLE__RELAY__SEND_BUFFER, etc.)
        .add_source(
            config::Environment::with_prefix("HUDDLE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Per-connection outbound event queue depth. Events to a client that
    /// falls this far behind are dropped instead of stalling the room
    /// (delivery is best-effort, at-most-once).
    pub send_buffer: usize,
    /// Upper bound on a single inbound event, in bytes. SDP payloads are a
    /// few KB; anything past this is a misbehaving client.
    pub max_event_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            max_event_bytes: 65_536,
        }
    }
}
