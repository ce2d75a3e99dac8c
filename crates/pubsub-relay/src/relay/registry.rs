//! Registry of live session relays keyed by transport session id.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RelayConfig;
use super::session::SessionRelay;
use super::types::{ClientCommand, ServerEvent};
use crate::store::PubSubBackend;

/// Bookkeeping for one running relay task.
struct SessionSlot {
    generation: u64,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionSlot {
    /// Signal the relay to stop and wait for it, aborting after `grace`.
    async fn stop(self, grace: Duration) {
        self.shutdown.cancel();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!("Session task ended abnormally: {}", e),
            Err(_) => {
                warn!("Session task did not stop within {:?}, aborting", grace);
                abort.abort();
            }
        }
    }
}

/// The transport's side of a session: commands in, events out.
pub struct SessionHandle {
    pub id: String,
    /// Distinguishes this handle from a later session reusing the same id.
    pub generation: u64,
    pub commands: mpsc::Sender<ClientCommand>,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Maps transport session ids to running [`SessionRelay`] tasks.
///
/// Opening an id that is already live replaces the old relay, and closing is
/// tied to the generation that opened it, so a late close from a replaced
/// transport never tears down its successor.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionSlot>,
    backend: Arc<dyn PubSubBackend>,
    config: RelayConfig,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PubSubBackend>, config: RelayConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            backend,
            config,
            generations: AtomicU64::new(0),
        }
    }

    /// Start a relay for `id` and return the transport handle.
    pub async fn open(&self, id: &str) -> SessionHandle {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands, command_rx) = mpsc::channel(self.config.buffer());
        let (event_tx, events) = mpsc::channel(self.config.buffer());

        let relay = SessionRelay::new(
            id,
            self.backend.clone(),
            &self.config,
            command_rx,
            event_tx,
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(relay.run(shutdown.clone()));

        let previous = self.sessions.insert(
            id.to_string(),
            SessionSlot {
                generation,
                shutdown,
                task,
            },
        );
        if let Some(previous) = previous {
            info!("Session {} reopened, stopping previous relay", id);
            previous.stop(self.grace()).await;
        }

        debug!("Session {} opened (generation {})", id, generation);
        SessionHandle {
            id: id.to_string(),
            generation,
            commands,
            events,
        }
    }

    /// Stop the relay opened with `generation`. Returns false if the id is
    /// unknown or now belongs to a newer generation.
    pub async fn close(&self, id: &str, generation: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, slot| slot.generation == generation);
        match removed {
            Some((_, slot)) => {
                slot.stop(self.grace()).await;
                info!("Session {} closed", id);
                true
            }
            None => false,
        }
    }

    /// Stop every relay. Used on server shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let slots: Vec<SessionSlot> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, slot)| slot))
            .collect();
        if slots.is_empty() {
            return;
        }

        info!("Stopping {} session(s)", slots.len());
        let grace = self.grace();
        futures::future::join_all(slots.into_iter().map(|slot| slot.stop(grace))).await;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Time a relay gets to release its connection before being aborted.
    fn grace(&self) -> Duration {
        self.config.op_timeout() * 2
    }
}
