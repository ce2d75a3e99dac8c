//! Event protocol between browser clients and the relay.
//!
//! Frames are JSON envelopes `{"event": <name>, "data": <payload>}` in both
//! directions. Payload-less events omit `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::coerce::{Coerced, coerce_fields};
use super::history::MessageEntry;
use crate::store::{ConnectParams, DEFAULT_PORT};

// ============================================================================
// Events (Relay -> Client)
// ============================================================================

/// Connection details shown to the client. Never includes the password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub db: u32,
}

impl From<&ConnectParams> for ServerInfo {
    fn from(params: &ConnectParams) -> Self {
        Self {
            host: params.host.clone(),
            port: params.port,
            db: params.db,
        }
    }
}

/// Events pushed from the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `connect` and `disconnect`.
    ConnectionResult {
        connected: bool,
        success: bool,
        message: String,
    },

    /// Current connection state and subscribed channels.
    ConnectionStatus {
        connected: bool,
        channels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<ServerInfo>,
    },

    SubscribeResult {
        success: bool,
        channel: String,
        message: String,
    },

    UnsubscribeResult {
        success: bool,
        channel: String,
        message: String,
    },

    PublishResult {
        success: bool,
        message: String,
    },

    /// A sent or received message, pushed as it happens.
    Message(MessageEntry),

    /// Bulk replay of retained messages, oldest first.
    MessageHistory(Vec<MessageEntry>),

    /// Unparseable frame or unknown event.
    Error { message: String },

    /// Keepalive.
    Ping,
}

// ============================================================================
// Commands (Client -> Relay)
// ============================================================================

/// Validated command from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Connect(ConnectParams),
    Disconnect,
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: Value },
    Status,
    History,
    Pong,
    /// A frame that failed validation; answered without touching the store.
    Rejected(Rejection),
}

/// Which request a rejection answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Why a client frame was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// `None` when the frame could not be attributed to a request.
    pub kind: Option<RequestKind>,
    pub channel: String,
    pub message: String,
}

impl Rejection {
    fn new(kind: RequestKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            channel: String::new(),
            message: message.into(),
        }
    }

    fn unattributed(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            channel: String::new(),
            message: message.into(),
        }
    }

    fn with_channel(mut self, channel: &str) -> Self {
        self.channel = channel.to_string();
        self
    }

    /// The event answering the rejected request.
    pub fn into_event(self, connected: bool) -> ServerEvent {
        let Rejection {
            kind,
            channel,
            message,
        } = self;
        match kind {
            Some(RequestKind::Connect) => ServerEvent::ConnectionResult {
                connected,
                success: false,
                message,
            },
            Some(RequestKind::Subscribe) => ServerEvent::SubscribeResult {
                success: false,
                channel,
                message,
            },
            Some(RequestKind::Unsubscribe) => ServerEvent::UnsubscribeResult {
                success: false,
                channel,
                message,
            },
            Some(RequestKind::Publish) => ServerEvent::PublishResult {
                success: false,
                message,
            },
            None => ServerEvent::Error { message },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientCommand {
    /// Parse a text frame. Never fails: invalid frames become
    /// [`ClientCommand::Rejected`].
    pub fn parse(text: &str) -> Self {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                return ClientCommand::Rejected(Rejection::unattributed(format!(
                    "Invalid frame: {e}"
                )));
            }
        };
        Self::from_event(&envelope.event, &envelope.data)
            .unwrap_or_else(ClientCommand::Rejected)
    }

    fn from_event(event: &str, data: &Value) -> Result<Self, Rejection> {
        match event {
            "connect" => parse_connect(data).map(ClientCommand::Connect),
            "disconnect" => Ok(ClientCommand::Disconnect),
            "subscribe" => {
                let channel = required_channel(data, RequestKind::Subscribe)?;
                Ok(ClientCommand::Subscribe { channel })
            }
            "unsubscribe" => {
                let channel = required_channel(data, RequestKind::Unsubscribe)?;
                Ok(ClientCommand::Unsubscribe { channel })
            }
            "publish" => parse_publish(data),
            "status" => Ok(ClientCommand::Status),
            "history" => Ok(ClientCommand::History),
            "pong" => Ok(ClientCommand::Pong),
            other => Err(Rejection::unattributed(format!("Unknown event: {other}"))),
        }
    }
}

fn field<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    data.get(name).filter(|value| !value.is_null())
}

fn required_channel(data: &Value, kind: RequestKind) -> Result<String, Rejection> {
    match field(data, "channel") {
        Some(Value::String(channel)) if !channel.trim().is_empty() => {
            Ok(channel.trim().to_string())
        }
        Some(Value::String(_)) | None => {
            Err(Rejection::new(kind, "Missing required field: channel"))
        }
        Some(_) => Err(Rejection::new(kind, "Field 'channel' must be a string")),
    }
}

/// Read an unsigned integer that may arrive as a number or numeric text.
fn unsigned_field(data: &Value, name: &str, default: u64) -> Result<u64, Rejection> {
    let invalid = || {
        Rejection::new(
            RequestKind::Connect,
            format!("Field '{name}' must be a non-negative integer"),
        )
    };
    match field(data, name) {
        None => Ok(default),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(invalid),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(default),
        Some(Value::String(text)) => Coerced::parse(text).as_u64().ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}

fn parse_connect(data: &Value) -> Result<ConnectParams, Rejection> {
    let host = match field(data, "host") {
        Some(Value::String(host)) if !host.trim().is_empty() => host.trim().to_string(),
        Some(Value::String(_)) | None => {
            return Err(Rejection::new(
                RequestKind::Connect,
                "Missing required field: host",
            ));
        }
        Some(_) => {
            return Err(Rejection::new(
                RequestKind::Connect,
                "Field 'host' must be a string",
            ));
        }
    };

    let port = unsigned_field(data, "port", u64::from(DEFAULT_PORT))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            Rejection::new(RequestKind::Connect, "Field 'port' must be between 1 and 65535")
        })?;

    let db = unsigned_field(data, "db", 0)?;
    let db = u32::try_from(db)
        .map_err(|_| Rejection::new(RequestKind::Connect, "Field 'db' is out of range"))?;

    let password = match field(data, "password") {
        Some(Value::String(password)) => password.clone(),
        None => String::new(),
        Some(_) => {
            return Err(Rejection::new(
                RequestKind::Connect,
                "Field 'password' must be a string",
            ));
        }
    };

    Ok(ConnectParams::new(host, port)
        .with_password(password)
        .with_db(db))
}

fn parse_publish(data: &Value) -> Result<ClientCommand, Rejection> {
    let channel = required_channel(data, RequestKind::Publish)?;
    let reject = |message: &str| Rejection::new(RequestKind::Publish, message).with_channel(&channel);

    let payload = match (field(data, "message"), field(data, "fields")) {
        (Some(Value::Object(object)), _) => object.clone(),
        (Some(Value::String(text)), _) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return Err(reject("Message must be a JSON object")),
            Err(_) => return Err(reject("Invalid JSON format")),
        },
        (Some(_), _) => return Err(reject("Message must be a JSON object")),
        (None, Some(Value::Object(fields))) => coerce_fields(fields),
        (None, Some(_)) => return Err(reject("Field 'fields' must be an object")),
        (None, None) => return Err(reject("Missing required field: message")),
    };

    if payload.is_empty() {
        return Err(reject("Message must contain at least one field"));
    }

    Ok(ClientCommand::Publish {
        channel,
        payload: Value::Object(payload),
    })
}
