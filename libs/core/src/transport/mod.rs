//! Channels to the chat backend.
//!
//! A [`Transport`] is one raw mechanism (WebSocket, CORS POST or JSONP GET). The
//! [`TransportConnection`] drives a transport through handshake, reconnect and
//! teardown, and the [`ConnectionSelector`] decides which transport an instance
//! gets.

mod connection;
mod cors;
mod jsonp;
mod selector;
mod websocket;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::WireRequest;

pub use connection::{ConnectionEvent, ConnectionSettings, TransportConnection};
pub use cors::CorsTransport;
pub use jsonp::JsonpTransport;
pub use selector::ConnectionSelector;
pub use websocket::WebSocketTransport;

/// Frames pushed by the backend on a persistent channel, in arrival order.
pub type FrameReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Reconnecting => "reconnecting",
            TransportState::Failed => "failed",
        }
    }

    /// An attempt cycle is running.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TransportState::Connecting | TransportState::Reconnecting
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens the underlying channel. Persistent transports return the receiver
    /// for pushed frames.
    async fn open(&mut self) -> Result<Option<FrameReceiver>, TransportError>;

    /// Writes one request. Request/response transports return the raw reply body.
    async fn send(&mut self, request: WireRequest) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_lowercase() {
        assert_eq!(TransportState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&TransportState::Failed).unwrap(),
            "\"failed\""
        );
        assert!(TransportState::Connecting.is_pending());
        assert!(!TransportState::Failed.is_pending());
    }
}
