use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{
    ConnectionEvent, ConnectionSettings, CorsTransport, JsonpTransport, Transport,
    TransportConnection, WebSocketTransport,
};
use crate::config::{ConnectionDescriptor, RetryPolicy, Timeouts, TransportKind};
use crate::error::ConfigError;
use crate::router::MessageRouter;
use crate::session::{InstanceId, SharedSessionKey};

/// Picks the transport for one instance and owns its reconnection policy.
#[derive(Clone, Debug)]
pub struct ConnectionSelector {
    url: Url,
    kind: TransportKind,
    settings: ConnectionSettings,
    client: Option<Client>,
}

impl ConnectionSelector {
    /// Validates the descriptor. Unsupported schemes are rejected here, before
    /// anything connects.
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self, ConfigError> {
        let url = descriptor.url()?;
        let kind = Self::select(&url, descriptor.forced_transport)?;
        debug!(url = %url, transport = kind.as_str(), "transport selected");
        Ok(Self {
            url,
            kind,
            settings: ConnectionSettings {
                timeouts: descriptor.timeouts,
                retry_policy: descriptor.retry_policy,
            },
            client: None,
        })
    }

    /// Shares an HTTP client (connection pool, proxy settings) with the host.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn select(url: &Url, forced: Option<TransportKind>) -> Result<TransportKind, ConfigError> {
        let scheme = url.scheme();
        if !matches!(scheme, "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(scheme.to_string()));
        }
        if let Some(kind) = forced {
            return Ok(kind);
        }
        match scheme {
            "ws" | "wss" => Ok(TransportKind::WebSocket),
            _ => Ok(TransportKind::Cors),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry_policy
    }

    pub fn timeouts(&self) -> Timeouts {
        self.settings.timeouts
    }

    /// URL the selected transport dials, with the scheme family swapped when a
    /// transport is forced onto a url of the other family.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let mut url = self.url.clone();
        let scheme = match (self.kind, url.scheme()) {
            (TransportKind::WebSocket, "http") => Some("ws"),
            (TransportKind::WebSocket, "https") => Some("wss"),
            (TransportKind::Cors | TransportKind::Jsonp, "ws") => Some("http"),
            (TransportKind::Cors | TransportKind::Jsonp, "wss") => Some("https"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        }
        Ok(url)
    }

    pub fn build(&self) -> Result<Box<dyn Transport>, ConfigError> {
        let endpoint = self.endpoint()?;
        let transport: Box<dyn Transport> = match self.kind {
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(endpoint)),
            TransportKind::Cors => Box::new(CorsTransport::new(self.http_client(), endpoint)),
            TransportKind::Jsonp => Box::new(JsonpTransport::new(self.http_client(), endpoint)),
        };
        Ok(transport)
    }

    /// Builds a fresh transport and starts its connection task.
    pub fn spawn(
        &self,
        instance_id: InstanceId,
        session_key: SharedSessionKey,
    ) -> Result<(TransportConnection, mpsc::UnboundedReceiver<ConnectionEvent>), ConfigError> {
        let transport = self.build()?;
        let router = MessageRouter::new(instance_id, self.kind);
        Ok(TransportConnection::spawn(
            transport,
            router,
            session_key,
            self.settings.clone(),
        ))
    }

    fn http_client(&self) -> Client {
        self.client.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(url: &str, forced: Option<TransportKind>) -> Result<TransportKind, ConfigError> {
        let mut descriptor = ConnectionDescriptor::new(url);
        descriptor.forced_transport = forced;
        ConnectionSelector::new(&descriptor).map(|selector| selector.kind())
    }

    #[test]
    fn scheme_decides_without_forcing() {
        assert_eq!(
            selected("wss://example.test/chat", None).unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            selected("ws://localhost:8080/ws", None).unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!(
            selected("https://example.test/chat", None).unwrap(),
            TransportKind::Cors
        );
        assert_eq!(
            selected("http://localhost/chat", None).unwrap(),
            TransportKind::Cors
        );
    }

    #[test]
    fn forced_transport_wins() {
        assert_eq!(
            selected("wss://example.test/chat", Some(TransportKind::Jsonp)).unwrap(),
            TransportKind::Jsonp
        );
        assert_eq!(
            selected("https://example.test/chat", Some(TransportKind::WebSocket)).unwrap(),
            TransportKind::WebSocket
        );
    }

    #[test]
    fn jsonp_is_never_chosen_implicitly() {
        for url in ["ws://a.test", "wss://a.test", "http://a.test", "https://a.test"] {
            assert_ne!(selected(url, None).unwrap(), TransportKind::Jsonp);
        }
    }

    #[test]
    fn other_schemes_are_configuration_errors() {
        assert!(matches!(
            selected("ftp://example.test/chat", None),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
        assert!(matches!(
            selected("file:///tmp/chat", Some(TransportKind::Cors)),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            selected("not a url", None),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn forced_transport_dials_its_own_scheme_family() {
        let descriptor = ConnectionDescriptor::new("wss://example.test/chat?tenant=acme")
            .with_forced_transport(TransportKind::Jsonp);
        let selector = ConnectionSelector::new(&descriptor).unwrap();
        assert_eq!(
            selector.endpoint().unwrap().as_str(),
            "https://example.test/chat?tenant=acme"
        );

        let descriptor = ConnectionDescriptor::new("http://localhost:9000/ws")
            .with_forced_transport(TransportKind::WebSocket);
        let selector = ConnectionSelector::new(&descriptor).unwrap();
        assert_eq!(
            selector.endpoint().unwrap().as_str(),
            "ws://localhost:9000/ws"
        );
    }

    #[test]
    fn retry_policy_comes_from_descriptor() {
        let policy = RetryPolicy {
            max_retries: 9,
            ..RetryPolicy::default()
        };
        let descriptor = ConnectionDescriptor::new("https://example.test").with_retry_policy(policy);
        let selector = ConnectionSelector::new(&descriptor).unwrap();
        assert_eq!(selector.retry_policy().max_retries, 9);
        assert_eq!(selector.build().unwrap().kind(), TransportKind::Cors);
    }
}
