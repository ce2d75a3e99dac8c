//! Backing store trait definitions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::{StoreError, StoreResult};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Stream of raw payloads delivered on one subscribed channel.
///
/// The stream ends when the underlying connection goes away.
pub type PayloadStream = BoxStream<'static, StoreResult<String>>;

/// Parameters for connecting to the pub/sub service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u32,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: 0,
        }
    }

    /// Set the password. Empty strings mean "no password".
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Check the parameters before any network activity.
    pub fn validate(&self) -> StoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(StoreError::InvalidParams("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(StoreError::InvalidParams(
                "port must be between 1 and 65535".into(),
            ));
        }
        Ok(())
    }
}

/// Factory for connections to a pub/sub service.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open a connection. Implementations must not return a half-open link.
    async fn open(&self, params: &ConnectParams) -> StoreResult<Box<dyn StoreLink>>;
}

/// One live connection to the pub/sub service.
///
/// Dropping the link releases the connection.
#[async_trait]
pub trait StoreLink: Send + Sync {
    /// Liveness check (PING).
    async fn ping(&mut self) -> StoreResult<()>;

    /// Publish text on a channel. Returns the number of receivers.
    async fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<u64>;

    /// Subscribe to a channel and return its message stream.
    ///
    /// Dropping the stream unsubscribes.
    async fn listen(&self, channel: &str) -> StoreResult<PayloadStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password_means_none() {
        let params = ConnectParams::new("localhost", DEFAULT_PORT).with_password("");
        assert_eq!(params.password, None);
        let params = params.with_password("secret");
        assert_eq!(params.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validate_rejects_bad_params() {
        assert!(ConnectParams::new("localhost", 6379).validate().is_ok());
        assert!(matches!(
            ConnectParams::new("  ", 6379).validate(),
            Err(StoreError::InvalidParams(_))
        ));
        assert!(matches!(
            ConnectParams::new("localhost", 0).validate(),
            Err(StoreError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let params = ConnectParams::new("localhost", 6379)
            .with_password("hunter2")
            .with_db(3);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["host"], "localhost");
        assert_eq!(json["db"], 3);
        assert!(json.get("password").is_none());
    }
}
