//! Connection and presentation settings supplied by the host.
//!
//! A [`ConnectionDescriptor`] is resolved once per chat instance. Hosts can build it
//! programmatically, deserialize it from JSON, or read it from `CHAT_WIDGET_*`
//! environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MAX_HISTORY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "ws")]
    WebSocket,
    Cors,
    Jsonp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Cors => "cors",
            TransportKind::Jsonp => "jsonp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "cors" | "http" => Ok(TransportKind::Cors),
            "jsonp" => Ok(TransportKind::Jsonp),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(rename = "connectMs", with = "duration_ms")]
    pub connect: Duration,
    #[serde(rename = "requestMs", with = "duration_ms")]
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(rename = "baseDelayMs", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before the connection gives up.
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presentation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_open: bool,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Ask the backend for a greeting after the first handshake.
    #[serde(default = "default_true")]
    pub greet_on_connect: bool,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            title: None,
            start_open: false,
            max_history: DEFAULT_MAX_HISTORY,
            greet_on_connect: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub target_url: String,
    #[serde(default)]
    pub forced_transport: Option<TransportKind>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub presentation: Presentation,
}

impl ConnectionDescriptor {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            forced_transport: None,
            timeouts: Timeouts::default(),
            retry_policy: RetryPolicy::default(),
            presentation: Presentation::default(),
        }
    }

    pub fn with_forced_transport(mut self, transport: TransportKind) -> Self {
        self.forced_transport = Some(transport);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_presentation(mut self, presentation: Presentation) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.target_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.target_url.clone(),
            source,
        })
    }

    /// Reads `CHAT_WIDGET_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target_url = lookup("CHAT_WIDGET_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("CHAT_WIDGET_URL"))?;
        let mut descriptor = Self::new(target_url.trim());

        if let Some(raw) = lookup("CHAT_WIDGET_TRANSPORT").filter(|v| !v.trim().is_empty()) {
            descriptor.forced_transport = Some(raw.parse()?);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "CHAT_WIDGET_CONNECT_TIMEOUT_MS")? {
            descriptor.timeouts.connect = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "CHAT_WIDGET_REQUEST_TIMEOUT_MS")? {
            descriptor.timeouts.request = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "CHAT_WIDGET_RETRY_BASE_MS")? {
            descriptor.retry_policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "CHAT_WIDGET_RETRY_MAX_MS")? {
            descriptor.retry_policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_number::<u32>(&lookup, "CHAT_WIDGET_MAX_RETRIES")? {
            descriptor.retry_policy.max_retries = retries;
        }
        if let Some(max) = parse_number::<usize>(&lookup, "CHAT_WIDGET_MAX_HISTORY")? {
            descriptor.presentation.max_history = max;
        }
        if let Some(title) = lookup("CHAT_WIDGET_TITLE").filter(|v| !v.trim().is_empty()) {
            descriptor.presentation.title = Some(title);
        }
        Ok(descriptor)
    }
}

fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

fn default_true() -> bool {
    true
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(entries: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_lookup_requires_url() {
        let err = ConnectionDescriptor::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CHAT_WIDGET_URL")));
    }

    #[test]
    fn env_lookup_reads_overrides() {
        let descriptor = ConnectionDescriptor::from_lookup(lookup_from(&[
            ("CHAT_WIDGET_URL", " https://chat.example.test/api "),
            ("CHAT_WIDGET_TRANSPORT", "JSONP"),
            ("CHAT_WIDGET_CONNECT_TIMEOUT_MS", "250"),
            ("CHAT_WIDGET_MAX_RETRIES", "2"),
            ("CHAT_WIDGET_TITLE", "Support"),
        ]))
        .unwrap();
        assert_eq!(descriptor.target_url, "https://chat.example.test/api");
        assert_eq!(descriptor.forced_transport, Some(TransportKind::Jsonp));
        assert_eq!(descriptor.timeouts.connect, Duration::from_millis(250));
        assert_eq!(descriptor.retry_policy.max_retries, 2);
        assert_eq!(descriptor.presentation.title.as_deref(), Some("Support"));
    }

    #[test]
    fn env_lookup_rejects_garbage_numbers() {
        let err = ConnectionDescriptor::from_lookup(lookup_from(&[
            ("CHAT_WIDGET_URL", "wss://chat.example.test"),
            ("CHAT_WIDGET_MAX_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "CHAT_WIDGET_MAX_RETRIES",
                ..
            }
        ));
    }

    #[test]
    fn descriptor_deserializes_from_host_json() {
        let descriptor: ConnectionDescriptor = serde_json::from_str(
            r#"{
                "targetUrl": "wss://example.test/chat",
                "forcedTransport": "ws",
                "retryPolicy": {"baseDelayMs": 100, "maxDelayMs": 800, "maxRetries": 3},
                "presentation": {"title": "Help", "startOpen": true}
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.forced_transport, Some(TransportKind::WebSocket));
        assert_eq!(descriptor.retry_policy.base_delay, Duration::from_millis(100));
        assert!(descriptor.retry_policy.jitter);
        assert!(descriptor.presentation.start_open);
        assert_eq!(descriptor.presentation.max_history, DEFAULT_MAX_HISTORY);
        assert_eq!(descriptor.timeouts, Timeouts::default());
    }
}
