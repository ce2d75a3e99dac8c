//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::relay::SessionRegistry;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live session relays.
    pub registry: Arc<SessionRegistry>,
    /// Shared secret for WebSocket upgrades, if configured.
    pub secret: Option<String>,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Origins allowed by CORS.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, server: &ServerConfig) -> Self {
        Self {
            registry,
            secret: server.secret.clone().filter(|s| !s.is_empty()),
            ping_interval: Duration::from_secs(server.ping_interval_secs.max(1)),
            allowed_origins: server.allowed_origins.clone(),
        }
    }

    /// Check a presented token against the configured secret.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match &self.secret {
            None => true,
            Some(secret) => token == Some(secret.as_str()),
        }
    }
}
