//! In-process pub/sub broker.
//!
//! Behaves like a single Redis server living inside the process: channels are
//! broadcast queues, every link and every subscription stream counts as an open
//! handle. Used by `serve --memory` and by the test suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::{
    ConnectParams, PayloadStream, PubSubBackend, StoreError, StoreLink, StoreResult,
};

/// Capacity of each channel's broadcast queue.
const CHANNEL_CAPACITY: usize = 1024;

/// Shared in-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    channels: DashMap<String, broadcast::Sender<String>>,
    password: Option<String>,
    offline: AtomicBool,
    /// Bumped by `sever`; links from an older epoch are dead.
    epoch: AtomicU64,
    open_handles: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that rejects connections without this password.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                password: Some(password.into()),
                ..Default::default()
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop every existing connection, as if the server restarted.
    ///
    /// Subscription streams end and later operations on old links fail.
    pub fn sever(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.channels.clear();
        debug!("Memory broker severed all connections");
    }

    /// Number of links and subscription streams currently alive.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Publish from outside any session (e.g. another process in tests).
    pub fn inject(&self, channel: &str, payload: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .and_then(|sender| sender.send(payload.to_string()).ok())
            .unwrap_or(0)
    }

    fn handle(&self) -> HandleGuard {
        self.inner.open_handles.fetch_add(1, Ordering::SeqCst);
        HandleGuard {
            inner: self.inner.clone(),
        }
    }
}

/// Counts an open handle until dropped.
struct HandleGuard {
    inner: Arc<BrokerInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PubSubBackend for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, params: &ConnectParams) -> StoreResult<Box<dyn StoreLink>> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable(format!(
                "connection refused by {}:{}",
                params.host, params.port
            )));
        }
        if let Some(expected) = &self.inner.password
            && params.password.as_deref() != Some(expected.as_str())
        {
            return Err(StoreError::AuthRejected(
                "invalid username-password pair".into(),
            ));
        }

        Ok(Box::new(MemoryLink {
            broker: self.clone(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            _guard: self.handle(),
        }))
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    epoch: u64,
    _guard: HandleGuard,
}

impl MemoryLink {
    fn ensure_alive(&self) -> StoreResult<()> {
        if self.broker.inner.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(StoreError::ConnectionLost(
                "connection reset by broker".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreLink for MemoryLink {
    async fn ping(&mut self) -> StoreResult<()> {
        self.ensure_alive()
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> StoreResult<u64> {
        self.ensure_alive()?;
        Ok(self.broker.inject(channel, payload) as u64)
    }

    async fn listen(&self, channel: &str) -> StoreResult<PayloadStream> {
        self.ensure_alive()?;
        let receiver = self
            .broker
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let guard = self.broker.handle();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let _held = &guard;
            let out = match item {
                Ok(payload) => Some(Ok(payload)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Memory broker subscriber on {channel} lagged, {skipped} messages skipped");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(stream.boxed())
    }
}
