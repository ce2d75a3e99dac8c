//! WebSocket relay for a pub/sub key-value store.
//!
//! Each WebSocket session gets its own store connection, a listener task per
//! subscribed channel and a bounded message history.

pub mod api;
pub mod config;
pub mod relay;
pub mod store;
