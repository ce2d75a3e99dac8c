//! Per-subscription listener tasks.

use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PayloadStream;

/// Identifier of one listener task. Unique within a session.
pub type ListenerId = u64;

/// Event sent from a listener task to its session relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// A message arrived on the listener's channel.
    Message {
        listener: ListenerId,
        channel: String,
        payload: Value,
    },
    /// The subscription stream failed or closed while still wanted.
    Lost {
        listener: ListenerId,
        channel: String,
        reason: String,
    },
}

impl ListenerEvent {
    pub fn listener(&self) -> ListenerId {
        match self {
            ListenerEvent::Message { listener, .. } | ListenerEvent::Lost { listener, .. } => {
                *listener
            }
        }
    }
}

/// Decode a payload from its wire text. Non-JSON text is kept as a string.
pub fn decode_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Handle owned by the store client for one running listener.
///
/// Dropping the handle cancels the task.
pub struct Listener {
    pub id: ListenerId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Spawn a listener forwarding `stream` to `events`.
    pub fn spawn(
        id: ListenerId,
        channel: String,
        stream: PayloadStream,
        events: mpsc::Sender<ListenerEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(id, channel, stream, events, cancel.clone()));
        Self {
            id,
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the task and wait for it to finish, aborting after `grace`.
    pub async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Listener {} did not stop within {:?}, aborting", self.id, grace);
                abort.abort();
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    id: ListenerId,
    channel: String,
    mut stream: PayloadStream,
    events: mpsc::Sender<ListenerEvent>,
    cancel: CancellationToken,
) {
    info!("Listener {id} started on channel {channel}");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(text)) => {
                debug!("Listener {id} received message on {channel}");
                ListenerEvent::Message {
                    listener: id,
                    channel: channel.clone(),
                    payload: decode_payload(&text),
                }
            }
            Some(Err(e)) => ListenerEvent::Lost {
                listener: id,
                channel: channel.clone(),
                reason: e.to_string(),
            },
            None => ListenerEvent::Lost {
                listener: id,
                channel: channel.clone(),
                reason: "subscription stream closed".to_string(),
            },
        };
        let lost = matches!(event, ListenerEvent::Lost { .. });
        if lost {
            warn!("Listener {id} lost its stream on {channel}");
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = events.send(event) => {
                if sent.is_err() {
                    debug!("Listener {id} has no relay to deliver to");
                    break;
                }
            }
        }

        if lost {
            break;
        }
    }

    info!("Listener {id} stopped on channel {channel}");
}
