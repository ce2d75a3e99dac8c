//! Backing store access layer.
//!
//! A trait-based abstraction over a pub/sub capable key-value service with
//! implementations for:
//! - Redis (production)
//! - An in-process broker (development and tests)
//!
//! [`StoreClient`] wraps one connection per session and owns the listener task
//! of every subscribed channel.

mod client;
mod error;
pub mod listener;
mod memory;
mod redis_backend;
mod traits;

pub use client::{ConnectionState, StoreClient, SubscribeOutcome, UnsubscribeOutcome};
pub use error::{StoreError, StoreResult};
pub use listener::{ListenerEvent, ListenerId};
pub use memory::MemoryBroker;
pub use redis_backend::RedisBackend;
pub use traits::{ConnectParams, DEFAULT_PORT, PayloadStream, PubSubBackend, StoreLink};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which backend new sessions connect through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redis,
    Memory,
}

/// Create a backend based on configuration.
pub fn create_backend(kind: BackendKind) -> Arc<dyn PubSubBackend> {
    match kind {
        BackendKind::Redis => Arc::new(RedisBackend::new()),
        BackendKind::Memory => Arc::new(MemoryBroker::new()),
    }
}
