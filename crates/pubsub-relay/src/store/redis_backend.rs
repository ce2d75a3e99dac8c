//! Redis implementation of the backing store traits.

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use super::{ConnectParams, PayloadStream, PubSubBackend, StoreLink, StoreResult};

/// Backend connecting to a real Redis server.
#[derive(Debug, Clone, Default)]
pub struct RedisBackend;

impl RedisBackend {
    pub fn new() -> Self {
        Self
    }
}

fn connection_info(params: &ConnectParams) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(params.host.clone(), params.port),
        redis: RedisConnectionInfo {
            db: i64::from(params.db),
            password: params.password.clone(),
            ..Default::default()
        },
    }
}

#[async_trait]
impl PubSubBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open(&self, params: &ConnectParams) -> StoreResult<Box<dyn StoreLink>> {
        let client = redis::Client::open(connection_info(params))?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Opened Redis connection to {}:{}", params.host, params.port);
        Ok(Box::new(RedisLink { client, conn }))
    }
}

/// A command connection plus the client used to open pub/sub connections.
struct RedisLink {
    client: redis::Client,
    conn: MultiplexedConnection,
}

#[async_trait]
impl StoreLink for RedisLink {
    async fn ping(&mut self) -> StoreResult<()> {
        let _pong: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<u64> {
        let receivers: u64 = self.conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn listen(&self, channel: &str) -> StoreResult<PayloadStream> {
        // Each listener gets its own connection; dropping the stream closes it.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| Ok(String::from_utf8_lossy(msg.get_payload_bytes()).into_owned()));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_from_params() {
        let params = ConnectParams::new("redis.internal", 6380)
            .with_password("pw")
            .with_db(2);
        let info = connection_info(&params);
        assert_eq!(
            info.addr,
            ConnectionAddr::Tcp("redis.internal".to_string(), 6380)
        );
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("pw"));
        assert_eq!(info.redis.username, None);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unreachable() {
        use crate::store::{StoreClient, StoreError};
        use std::sync::Arc;
        use std::time::Duration;

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let mut client = StoreClient::new(Arc::new(RedisBackend::new()), tx, Duration::from_secs(2));
        let err = client
            .connect(ConnectParams::new("127.0.0.1", port))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unreachable(_)), "got {err:?}");
        assert!(!client.is_connected());
        assert!(client.channels().is_empty());
    }
}
