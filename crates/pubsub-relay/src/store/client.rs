//! Per-session wrapper around one backing store connection.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::listener::{Listener, ListenerEvent, ListenerId};
use super::{ConnectParams, PubSubBackend, StoreError, StoreLink, StoreResult};

/// Connection state of a store client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Failed,
}

/// Result of a successful subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
}

/// Result of a successful unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    /// The channel was not subscribed. Treated as success.
    NotSubscribed,
}

/// Owns at most one connection to the pub/sub service and the listener
/// tasks of its subscriptions.
pub struct StoreClient {
    backend: Arc<dyn PubSubBackend>,
    state: ConnectionState,
    link: Option<Box<dyn StoreLink>>,
    params: Option<ConnectParams>,
    listeners: BTreeMap<String, Listener>,
    events: mpsc::Sender<ListenerEvent>,
    op_timeout: Duration,
    next_listener: ListenerId,
}

impl StoreClient {
    /// Create a disconnected client. Listener events are delivered on `events`.
    pub fn new(
        backend: Arc<dyn PubSubBackend>,
        events: mpsc::Sender<ListenerEvent>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            state: ConnectionState::Disconnected,
            link: None,
            params: None,
            listeners: BTreeMap::new(),
            events,
            op_timeout,
            next_listener: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.link.is_some()
    }

    /// Parameters of the current connection.
    pub fn params(&self) -> Option<&ConnectParams> {
        self.params.as_ref()
    }

    /// Subscribed channels in sorted order.
    pub fn channels(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Whether `id` belongs to a listener that is still active.
    pub fn owns_listener(&self, id: ListenerId) -> bool {
        self.listeners.values().any(|listener| listener.id == id)
    }

    /// Connect, replacing any existing connection.
    pub async fn connect(&mut self, params: ConnectParams) -> StoreResult<()> {
        params.validate()?;
        self.teardown().await;

        info!(
            "Connecting to {} at {}:{} (db {})",
            self.backend.name(),
            params.host,
            params.port,
            params.db
        );

        let op_timeout = self.op_timeout;
        let attempt = async {
            let mut link = bounded(op_timeout, "connecting", self.backend.open(&params)).await?;
            bounded(op_timeout, "waiting for PING", link.ping()).await?;
            Ok::<_, StoreError>(link)
        };

        match attempt.await {
            Ok(link) => {
                self.link = Some(link);
                self.params = Some(params);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {}:{} failed: {}", params.host, params.port, e);
                self.state = ConnectionState::Failed;
                Err(match e {
                    StoreError::ConnectionLost(msg) => StoreError::Unreachable(msg),
                    other => other,
                })
            }
        }
    }

    /// Stop all listeners and release the connection. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Disconnected;
    }

    /// Tear down after the connection was found dead.
    pub async fn mark_failed(&mut self) {
        self.teardown().await;
        self.state = ConnectionState::Failed;
    }

    async fn teardown(&mut self) {
        let listeners = std::mem::take(&mut self.listeners);
        if !listeners.is_empty() {
            debug!("Stopping {} listener(s)", listeners.len());
        }
        for (_, listener) in listeners {
            listener.stop(self.op_timeout).await;
        }
        if self.link.take().is_some() {
            info!("Released {} connection", self.backend.name());
        }
        self.params = None;
    }

    /// Publish a JSON payload on a channel.
    pub async fn publish(&mut self, channel: &str, payload: &Value) -> StoreResult<u64> {
        let op_timeout = self.op_timeout;
        let link = self.connected_link()?;
        let text = serde_json::to_string(payload)?;
        let receivers = bounded(op_timeout, "publishing", link.publish(channel, &text)).await?;
        debug!("Published to {channel} ({receivers} receivers)");
        Ok(receivers)
    }

    /// Subscribe to a channel, starting its listener.
    pub async fn subscribe(&mut self, channel: &str) -> StoreResult<SubscribeOutcome> {
        let op_timeout = self.op_timeout;
        if self.listeners.contains_key(channel) && self.is_connected() {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        let link = self.connected_link()?;
        let stream = bounded(op_timeout, "subscribing", link.listen(channel)).await?;

        self.next_listener += 1;
        let listener = Listener::spawn(
            self.next_listener,
            channel.to_string(),
            stream,
            self.events.clone(),
        );
        self.listeners.insert(channel.to_string(), listener);
        info!("Subscribed to {channel}");
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Unsubscribe from a channel. Channels that are not subscribed succeed
    /// with [`UnsubscribeOutcome::NotSubscribed`].
    pub async fn unsubscribe(&mut self, channel: &str) -> StoreResult<UnsubscribeOutcome> {
        match self.listeners.remove(channel) {
            Some(listener) => {
                listener.stop(self.op_timeout).await;
                info!("Unsubscribed from {channel}");
                Ok(UnsubscribeOutcome::Unsubscribed)
            }
            None => Ok(UnsubscribeOutcome::NotSubscribed),
        }
    }

    fn connected_link(&mut self) -> StoreResult<&mut Box<dyn StoreLink>> {
        if self.state != ConnectionState::Connected {
            return Err(StoreError::NotConnected);
        }
        self.link.as_mut().ok_or(StoreError::NotConnected)
    }
}

/// Run a store operation under the operation timeout.
async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            seconds: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBroker;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn client(broker: &MemoryBroker) -> (StoreClient, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (StoreClient::new(Arc::new(broker.clone()), tx, TIMEOUT), rx)
    }

    fn params() -> ConnectParams {
        ConnectParams::new("localhost", 6379)
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);

        assert!(matches!(
            client.publish("a", &json!({"k": 1})).await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("a").await,
            Err(StoreError::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_state() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let (mut client, _rx) = client(&broker);

        let err = client.connect(params()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(client.params().is_none());
        assert_eq!(broker.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_connecting() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);
        let err = client
            .connect(ConnectParams::new("", 6379))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidParams(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_double_subscribe_starts_one_listener() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);
        client.connect(params()).await.unwrap();

        assert_eq!(
            client.subscribe("alerts").await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            client.subscribe("alerts").await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(client.listener_count(), 1);
        assert_eq!(broker.subscriber_count("alerts"), 1);
    }

    #[tokio::test]
    async fn test_publish_round_trip_through_listener() {
        let broker = MemoryBroker::new();
        let (mut client, mut rx) = client(&broker);
        client.connect(params()).await.unwrap();
        client.subscribe("alerts").await.unwrap();

        let payload = json!({"level": "high", "nested": [1, true, null]});
        assert_eq!(client.publish("alerts", &payload).await.unwrap(), 1);

        match rx.recv().await.unwrap() {
            ListenerEvent::Message {
                channel,
                payload: got,
                listener,
            } => {
                assert_eq!(channel, "alerts");
                assert_eq!(got, payload);
                assert!(client.owns_listener(listener));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_is_lenient() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);

        assert_eq!(
            client.unsubscribe("never").await.unwrap(),
            UnsubscribeOutcome::NotSubscribed
        );

        client.connect(params()).await.unwrap();
        client.subscribe("a").await.unwrap();
        assert_eq!(
            client.unsubscribe("a").await.unwrap(),
            UnsubscribeOutcome::Unsubscribed
        );
        assert_eq!(broker.subscriber_count("a"), 0);
        assert!(client.channels().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);
        client.connect(params()).await.unwrap();
        for channel in ["a", "b", "c"] {
            client.subscribe(channel).await.unwrap();
        }
        assert_eq!(broker.open_handles(), 4);

        client.disconnect().await;
        assert_eq!(client.listener_count(), 0);
        assert_eq!(broker.open_handles(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // Idempotent.
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);
        client.connect(params()).await.unwrap();
        client.subscribe("a").await.unwrap();

        client.connect(params().with_db(1)).await.unwrap();
        assert_eq!(client.params().map(|p| p.db), Some(1));
        assert!(client.channels().is_empty());
        assert_eq!(broker.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_channels_sorted() {
        let broker = MemoryBroker::new();
        let (mut client, _rx) = client(&broker);
        client.connect(params()).await.unwrap();
        for channel in ["zeta", "alpha", "mid"] {
            client.subscribe(channel).await.unwrap();
        }
        assert_eq!(client.channels(), vec!["alpha", "mid", "zeta"]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_json() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::from),
                ".*".prop_map(Value::String),
            ];
            leaf.prop_recursive(3, 32, 6, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                    proptest::collection::btree_map("[a-z_]{1,8}", inner, 0..6)
                        .prop_map(|fields| Value::Object(fields.into_iter().collect())),
                ]
            })
        }

        fn arb_object() -> impl Strategy<Value = Value> {
            proptest::collection::btree_map("[a-z_]{1,8}", arb_json(), 1..6)
                .prop_map(|fields| Value::Object(fields.into_iter().collect()))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn published_objects_arrive_unchanged(payload in arb_object()) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let event = runtime.block_on(async {
                    let broker = MemoryBroker::new();
                    let (mut client, mut rx) = client(&broker);
                    client.connect(params()).await.unwrap();
                    client.subscribe("c").await.unwrap();
                    client.publish("c", &payload).await.unwrap();
                    let event = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
                    client.disconnect().await;
                    event
                });

                match event {
                    Some(ListenerEvent::Message { channel, payload: got, .. }) => {
                        prop_assert_eq!(channel, "c");
                        prop_assert_eq!(got, payload);
                    }
                    other => prop_assert!(false, "unexpected event {:?}", other),
                }
            }
        }
    }
}
