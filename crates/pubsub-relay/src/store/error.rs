//! Backing store error types.

use thiserror::Error;

/// Result type for backing store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the pub/sub service.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection parameters failed validation.
    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),

    /// The service could not be reached (refused, unresolvable, unreachable).
    #[error("Connection failed: {0}")]
    Unreachable(String),

    /// The service rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    AuthRejected(String),

    /// An operation did not complete within the configured timeout.
    #[error("Timed out after {seconds}s while {operation}")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The operation requires an established connection.
    #[error("Not connected to Redis")]
    NotConnected,

    /// Payload could not be encoded as JSON text.
    #[error("Payload is not JSON-representable: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A previously healthy connection went away.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Any other error reported by the service.
    #[error("Redis error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error means the underlying connection can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::Unreachable(_) | StoreError::Timeout { .. }
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::AuthenticationFailed
            || matches!(err.code(), Some("WRONGPASS") | Some("NOAUTH"))
        {
            StoreError::AuthRejected(err.to_string())
        } else if err.is_connection_refusal() {
            StoreError::Unreachable(err.to_string())
        } else if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::ConnectionLost(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}
