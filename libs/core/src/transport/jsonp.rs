use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::debug;
use url::Url;

use super::{FrameReceiver, Transport};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::WireRequest;
use crate::telemetry::ROUNDTRIP_SECONDS;

/// GET with query parameters; the backend answers `callback(json)`.
pub struct JsonpTransport {
    client: Client,
    endpoint: Url,
}

impl JsonpTransport {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    fn request_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        let merged = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query.to_string(),
        };
        url.set_query(Some(&merged));
        url
    }
}

#[async_trait]
impl Transport for JsonpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Jsonp
    }

    async fn open(&mut self) -> Result<Option<FrameReceiver>, TransportError> {
        Ok(None)
    }

    async fn send(&mut self, request: WireRequest) -> Result<Option<String>, TransportError> {
        let WireRequest::Jsonp(jsonp) = request else {
            return Err(TransportError::Protocol(
                "jsonp requests need a callback".into(),
            ));
        };
        let url = self.request_url(&jsonp.query_string());
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/javascript, */*;q=0.1")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        let text = response.text().await?;
        histogram!(ROUNDTRIP_SECONDS, "transport" => "jsonp")
            .record(started.elapsed().as_secs_f64());
        debug!(callback = %jsonp.callback, %status, "jsonp reply");
        Ok(Some(text))
    }

    async fn close(&mut self) {}
}
