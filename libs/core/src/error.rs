use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid target url `{url}`")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported url scheme `{0}` (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("unknown transport `{0}`")]
    UnknownTransport(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Failure of a single wire operation. Always transient from the point of view of
/// the connection; the retry policy decides whether it becomes terminal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error")]
    WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("http transport error")]
    Http(#[source] reqwest::Error),
    #[error("backend answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("channel closed by peer")]
    Dropped,
    #[error("transport is not open")]
    NotOpen,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Http(err)
    }
}

/// Outcome reported by a managed connection to its owner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("connection failed after exhausting retries")]
    Failed,
    #[error("connection is {0}")]
    NotConnected(TransportState),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayloadError {
    #[error("widget payload is not valid json for a known widget type: {0}")]
    Malformed(String),
    #[error("{kind} widget requires at least one option")]
    EmptyOptions { kind: &'static str },
    #[error("duplicate option value `{0}`")]
    DuplicateOption(String),
    #[error("slider range is empty (min {min} >= max {max})")]
    EmptyRange { min: f64, max: f64 },
    #[error("slider step must be positive, got {0}")]
    InvalidStep(f64),
    #[error("slider default {value} is outside [{min}, {max}]")]
    DefaultOutOfRange { value: f64, min: f64, max: f64 },
    #[error("rating max must be at least 1")]
    InvalidRatingMax,
    #[error("input pattern does not compile: {0}")]
    InvalidPattern(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("not connected (transport is {0})")]
    NotConnected(TransportState),
    #[error("message text is empty")]
    EmptyMessage,
    #[error("unknown widget `{0}`")]
    UnknownWidget(String),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
