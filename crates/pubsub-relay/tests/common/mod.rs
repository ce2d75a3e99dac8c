//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use pubsub_relay::api::{self, AppState};
use pubsub_relay::config::ServerConfig;
use pubsub_relay::relay::{RelayConfig, SessionRegistry};
use pubsub_relay::store::MemoryBroker;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Router plus the pieces tests want to poke at.
pub struct TestApp {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub broker: MemoryBroker,
}

pub fn test_app_with(server: ServerConfig, relay: RelayConfig) -> TestApp {
    let broker = MemoryBroker::new();
    let registry = Arc::new(SessionRegistry::new(Arc::new(broker.clone()), relay));
    let state = AppState::new(registry.clone(), &server);
    TestApp {
        router: api::create_router(state),
        registry,
        broker,
    }
}

pub fn test_app() -> TestApp {
    test_app_with(ServerConfig::default(), RelayConfig::default())
}

/// A relay server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub broker: MemoryBroker,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default(), RelayConfig::default()).await
    }

    pub async fn start_with(server: ServerConfig, relay: RelayConfig) -> Self {
        let app = test_app_with(server, relay);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.router).await.unwrap();
        });
        Self {
            addr,
            registry: app.registry,
            broker: app.broker,
        }
    }

    pub fn ws_url(&self, query: &str) -> String {
        if query.is_empty() {
            format!("ws://{}/ws", self.addr)
        } else {
            format!("ws://{}/ws?{}", self.addr, query)
        }
    }

    /// Open a client and consume the initial status and history replay.
    pub async fn client(&self, query: &str) -> WsClient {
        let mut client = WsClient::connect(&self.ws_url(query)).await;
        client.expect("connection_status").await;
        client.expect("message_history").await;
        client
    }

    /// Wait until the registry holds `count` sessions.
    pub async fn wait_for_sessions(&self, count: usize) {
        wait_until(|| self.registry.len() == count).await;
    }

    pub async fn wait_for_handles(&self, count: usize) {
        wait_until(|| self.broker.open_handles() == count).await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Minimal WebSocket client speaking the event envelope.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.expect("WebSocket handshake");
        Self { stream }
    }

    pub async fn emit(&mut self, event: &str, data: Value) {
        let frame = json!({"event": event, "data": data}).to_string();
        self.stream.send(Message::text(frame)).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.stream.send(Message::text(text.to_string())).await.unwrap();
    }

    /// Next event envelope, skipping keepalive pings.
    pub async fn next_event(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(EVENT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("WebSocket error");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["event"] != "ping" {
                    return value;
                }
            }
        }
    }

    /// Next event, which must be named `name`. Returns its data.
    pub async fn expect(&mut self, name: &str) -> Value {
        let event = self.next_event().await;
        assert_eq!(event["event"], name, "unexpected event {event}");
        event.get("data").cloned().unwrap_or(Value::Null)
    }

    /// Connect the session to the in-process broker.
    pub async fn connect_store(&mut self) {
        self.emit("connect", json!({"host": "localhost"})).await;
        let result = self.expect("connection_result").await;
        assert_eq!(result["success"], true, "{result}");
        let status = self.expect("connection_status").await;
        assert_eq!(status["connected"], true);
        self.expect("message_history").await;
    }

    pub async fn subscribe(&mut self, channel: &str) -> Value {
        self.emit("subscribe", json!({"channel": channel})).await;
        let result = self.expect("subscribe_result").await;
        if result["success"] == true {
            self.expect("connection_status").await;
        }
        result
    }

    /// Wait for the server to end the stream, skipping any frames still queued.
    pub async fn expect_closed(&mut self) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                match self.stream.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .expect("server did not close the stream");
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
