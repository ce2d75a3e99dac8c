//! Session relay between WebSocket clients and the backing store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Browser client (WebSocket)  │
//! └──────────────┬───────────────┘
//!                │ ClientCommand / ServerEvent
//! ┌──────────────▼───────────────┐      ┌───────────────────────────┐
//! │  SessionRelay (one task per  │◄─────│  Listener tasks (one per  │
//! │  session, single writer)     │      │  subscribed channel)      │
//! └──────────────┬───────────────┘      └─────────────▲─────────────┘
//!                │                                    │
//! ┌──────────────▼────────────────────────────────────┴─────────────┐
//! │  StoreClient: one connection to Redis per session               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`SessionRegistry`] maps transport session ids to running relays and
//! guarantees teardown when a transport goes away.

pub mod coerce;
mod history;
mod registry;
mod session;
mod types;

pub use history::{DEFAULT_HISTORY_LIMIT, Direction, MessageEntry, MessageHistory};
pub use registry::{SessionHandle, SessionRegistry};
pub use session::SessionRelay;
pub use types::{ClientCommand, Rejection, RequestKind, ServerEvent, ServerInfo};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for every session relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Messages retained per session.
    pub history_limit: usize,
    /// Upper bound for connect, publish, subscribe and teardown steps.
    pub op_timeout_secs: u64,
    /// Capacity of the per-session command, event and listener queues.
    pub event_buffer: usize,
}

impl RelayConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.max(1))
    }

    pub(crate) fn buffer(&self) -> usize {
        self.event_buffer.max(1)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            op_timeout_secs: 5,
            event_buffer: 256,
        }
    }
}
