//! Wire-level request and reply shapes exchanged with the chat backend.

use serde_json::Value;

use crate::message::NormalizedMessage;
use crate::session::SessionKey;
use crate::widget::InteractionEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundKind {
    Handshake,
    Connect,
    Message,
    Typing,
    WidgetInteraction,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Handshake => "handshake",
            OutboundKind::Connect => "connect",
            OutboundKind::Message => "message",
            OutboundKind::Typing => "typing",
            OutboundKind::WidgetInteraction => "widget-interaction",
        }
    }
}

/// Something the instance wants to tell the backend, before the session key is
/// attached and before it is shaped for a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Handshake,
    Connect,
    Message { text: String },
    Typing { typing: bool },
    WidgetInteraction(InteractionEvent),
}

impl Outbound {
    pub fn message(text: impl Into<String>) -> Self {
        Outbound::Message { text: text.into() }
    }

    pub fn kind(&self) -> OutboundKind {
        match self {
            Outbound::Handshake => OutboundKind::Handshake,
            Outbound::Connect => OutboundKind::Connect,
            Outbound::Message { .. } => OutboundKind::Message,
            Outbound::Typing { .. } => OutboundKind::Typing,
            Outbound::WidgetInteraction(_) => OutboundKind::WidgetInteraction,
        }
    }
}

/// Request in the shape the active transport puts on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum WireRequest {
    /// JSON body for WebSocket frames and CORS POSTs.
    Json(Value),
    Jsonp(JsonpRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonpRequest {
    pub callback: String,
    pub params: Vec<(String, String)>,
}

impl JsonpRequest {
    /// Percent-encoded query string, callback parameter included.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .chain(std::iter::once(("callback", self.callback.as_str())))
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeReply {
    pub status: String,
    pub session_key: Option<SessionKey>,
    pub message: Option<String>,
}

impl HandshakeReply {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "success" | "ok" | "resumed"
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackendError {
    pub message: String,
    pub severity: Severity,
    pub session_key: Option<SessionKey>,
}

/// A decoded reply or pushed frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Handshake(HandshakeReply),
    Message(NormalizedMessage),
    Typing {
        typing: bool,
        session_key: Option<SessionKey>,
    },
    Receipt {
        message_id: Option<String>,
    },
    Error(BackendError),
    Ack {
        session_key: Option<SessionKey>,
    },
}

impl Inbound {
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            Inbound::Handshake(reply) => reply.session_key.as_ref(),
            Inbound::Message(message) => message.session_key.as_ref(),
            Inbound::Typing { session_key, .. } | Inbound::Ack { session_key } => {
                session_key.as_ref()
            }
            Inbound::Error(error) => error.session_key.as_ref(),
            Inbound::Receipt { .. } => None,
        }
    }

    /// Whether this reply belongs in the visible message log.
    pub fn is_visible(&self) -> bool {
        match self {
            Inbound::Message(_) => true,
            Inbound::Error(error) => error.severity == Severity::Error,
            Inbound::Handshake(reply) => reply
                .message
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty()),
            Inbound::Typing { .. } | Inbound::Receipt { .. } | Inbound::Ack { .. } => false,
        }
    }
}
