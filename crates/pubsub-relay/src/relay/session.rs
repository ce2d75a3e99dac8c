//! Per-session relay task.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::RelayConfig;
use super::history::{Direction, MessageEntry, MessageHistory};
use super::types::{ClientCommand, ServerEvent, ServerInfo};
use crate::store::{
    ConnectParams, ListenerEvent, PubSubBackend, StoreClient, StoreError, SubscribeOutcome,
    UnsubscribeOutcome,
};

/// Binds one client session to one store connection.
///
/// All state is owned by the task running [`SessionRelay::run`]; client
/// commands and listener deliveries reach it through queues, so there is a
/// single writer for the connection, the subscription set and the history.
pub struct SessionRelay {
    id: String,
    client: StoreClient,
    history: MessageHistory,
    commands: mpsc::Receiver<ClientCommand>,
    listener_events: mpsc::Receiver<ListenerEvent>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl SessionRelay {
    pub fn new(
        id: impl Into<String>,
        backend: Arc<dyn PubSubBackend>,
        config: &RelayConfig,
        commands: mpsc::Receiver<ClientCommand>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let (listener_tx, listener_events) = mpsc::channel(config.buffer());
        Self {
            id: id.into(),
            client: StoreClient::new(backend, listener_tx, config.op_timeout()),
            history: MessageHistory::new(config.history_limit),
            commands,
            listener_events,
            outbound,
        }
    }

    /// Serve the session until the command queue closes or `shutdown` fires.
    /// The store connection is always released before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Session {} started", self.id);
        self.push_status().await;
        self.push_history().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = self.listener_events.recv() => {
                    self.handle_listener_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        self.client.disconnect().await;
        info!("Session {} closed", self.id);
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect(params) => self.connect(params).await,
            ClientCommand::Disconnect => self.disconnect().await,
            ClientCommand::Subscribe { channel } => self.subscribe(channel).await,
            ClientCommand::Unsubscribe { channel } => self.unsubscribe(channel).await,
            ClientCommand::Publish { channel, payload } => self.publish(channel, payload).await,
            ClientCommand::Status => self.push_status().await,
            ClientCommand::History => self.push_history().await,
            ClientCommand::Pong => {}
            ClientCommand::Rejected(rejection) => {
                debug!("Session {} rejected frame: {}", self.id, rejection.message);
                let event = rejection.into_event(self.client.is_connected());
                self.emit(event).await;
            }
        }
    }

    async fn connect(&mut self, params: ConnectParams) {
        match self.client.connect(params).await {
            Ok(()) => {
                self.emit(ServerEvent::ConnectionResult {
                    connected: true,
                    success: true,
                    message: "Connected successfully".to_string(),
                })
                .await;
                self.push_status().await;
                self.push_history().await;
            }
            Err(e) => {
                // Invalid parameters are rejected before the old link is torn down.
                self.emit(ServerEvent::ConnectionResult {
                    connected: self.client.is_connected(),
                    success: false,
                    message: e.to_string(),
                })
                .await;
                self.push_status().await;
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client.disconnect().await;
        self.emit(ServerEvent::ConnectionResult {
            connected: false,
            success: true,
            message: "Disconnected from Redis".to_string(),
        })
        .await;
        self.push_status().await;
    }

    async fn subscribe(&mut self, channel: String) {
        match self.client.subscribe(&channel).await {
            Ok(outcome) => {
                let message = match outcome {
                    SubscribeOutcome::Subscribed => format!("Subscribed to {channel}"),
                    SubscribeOutcome::AlreadySubscribed => {
                        format!("Already subscribed to {channel}")
                    }
                };
                self.emit(ServerEvent::SubscribeResult {
                    success: true,
                    channel,
                    message,
                })
                .await;
                self.push_status().await;
            }
            Err(e) => {
                self.emit(ServerEvent::SubscribeResult {
                    success: false,
                    channel,
                    message: format!("Subscribe failed: {e}"),
                })
                .await;
                self.fail_if_lost(&e).await;
            }
        }
    }

    async fn unsubscribe(&mut self, channel: String) {
        match self.client.unsubscribe(&channel).await {
            Ok(outcome) => {
                let message = match outcome {
                    UnsubscribeOutcome::Unsubscribed => format!("Unsubscribed from {channel}"),
                    UnsubscribeOutcome::NotSubscribed => format!("Not subscribed to {channel}"),
                };
                self.emit(ServerEvent::UnsubscribeResult {
                    success: true,
                    channel,
                    message,
                })
                .await;
                self.push_status().await;
            }
            Err(e) => {
                self.emit(ServerEvent::UnsubscribeResult {
                    success: false,
                    channel,
                    message: format!("Unsubscribe failed: {e}"),
                })
                .await;
                self.fail_if_lost(&e).await;
            }
        }
    }

    async fn publish(&mut self, channel: String, payload: Value) {
        match self.client.publish(&channel, &payload).await {
            Ok(_receivers) => {
                let entry = MessageEntry::new(Direction::Sent, channel, payload);
                self.history.push(entry.clone());
                self.emit(ServerEvent::Message(entry)).await;
                self.emit(ServerEvent::PublishResult {
                    success: true,
                    message: "Message published successfully".to_string(),
                })
                .await;
            }
            Err(e) => {
                self.emit(ServerEvent::PublishResult {
                    success: false,
                    message: e.to_string(),
                })
                .await;
                self.fail_if_lost(&e).await;
            }
        }
    }

    async fn handle_listener_event(&mut self, event: ListenerEvent) {
        if !self.client.owns_listener(event.listener()) {
            debug!(
                "Session {} dropped event from retired listener {}",
                self.id,
                event.listener()
            );
            return;
        }

        match event {
            ListenerEvent::Message {
                channel, payload, ..
            } => {
                let entry = MessageEntry::new(Direction::Received, channel, payload);
                self.history.push(entry.clone());
                self.emit(ServerEvent::Message(entry)).await;
            }
            ListenerEvent::Lost {
                channel, reason, ..
            } => {
                warn!(
                    "Session {} lost its subscription to {}: {}",
                    self.id, channel, reason
                );
                self.connection_lost(format!("Connection lost: {reason}"))
                    .await;
            }
        }
    }

    async fn fail_if_lost(&mut self, error: &StoreError) {
        if error.is_connection_lost() && self.client.is_connected() {
            self.connection_lost(error.to_string()).await;
        }
    }

    /// Force the session back to unconnected and tell the client.
    async fn connection_lost(&mut self, message: String) {
        self.client.mark_failed().await;
        self.emit(ServerEvent::ConnectionResult {
            connected: false,
            success: false,
            message,
        })
        .await;
        self.push_status().await;
    }

    async fn push_status(&self) {
        let event = ServerEvent::ConnectionStatus {
            connected: self.client.is_connected(),
            channels: self.client.channels(),
            server: self.client.params().map(ServerInfo::from),
        };
        self.emit(event).await;
    }

    async fn push_history(&self) {
        self.emit(ServerEvent::MessageHistory(self.history.snapshot()))
            .await;
    }

    async fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!("Session {} has no client attached, event dropped", self.id);
        }
    }
}
