//! HTTP API module.
//!
//! Serves the health endpoint and the WebSocket transport that binds each
//! client to a session relay.

mod error;
mod routes;
mod state;
mod ws;

pub use error::{ApiError, ErrorResponse};
pub use routes::{HealthResponse, create_router};
pub use state::AppState;
pub use ws::WsParams;
