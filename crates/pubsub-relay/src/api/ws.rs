//! WebSocket transport for session relays.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::state::AppState;
use crate::relay::{ClientCommand, ServerEvent, SessionHandle};

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Transport session id. A fresh one is generated when absent.
    pub session: Option<String>,
    /// Shared secret, required when the server has one configured.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if !state.authorize(params.token.as_deref()) {
        warn!("Rejected WebSocket upgrade with invalid token");
        return Err(ApiError::unauthorized("Invalid or missing token"));
    }

    let session_id = params
        .session
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("WebSocket upgrade request for session {}", session_id);

    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, session_id)))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let SessionHandle {
        id,
        generation,
        commands,
        mut events,
    } = state.registry.open(&session_id).await;

    // Forward relay events and keepalive pings to the client. Ends with a
    // close frame once the relay goes away, e.g. when the session id is
    // reopened by another transport.
    let ping_interval = state.ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        let frame = CloseFrame {
                            code: close_code::NORMAL,
                            reason: "Session closed".into(),
                        };
                        let _ = sender.send(Message::Close(Some(frame))).await;
                        break;
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if send_event(&mut sender, &ServerEvent::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        let command = ClientCommand::parse(text.as_str());
                        if commands.send(command).await.is_err() {
                            debug!("Relay for session {} is gone", id);
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        debug!("Ignoring binary frame on session {}", id);
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        info!("Session {} closed by client", id);
                        break;
                    }
                    Err(e) => {
                        warn!("WebSocket error on session {}: {}", id, e);
                        break;
                    }
                }
            }
            _ = &mut send_task => {
                debug!("Outbound side of session {} finished", id);
                break;
            }
        }
    }

    drop(commands);
    state.registry.close(&id, generation).await;
    send_task.abort();
    info!("WebSocket connection closed for session {}", id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
