use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::{FrameReceiver, Transport};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::WireRequest;
use crate::telemetry::ROUNDTRIP_SECONDS;

/// JSON POST per request; the reply body is the correlated answer.
pub struct CorsTransport {
    client: Client,
    endpoint: Url,
}

impl CorsTransport {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Transport for CorsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cors
    }

    async fn open(&mut self) -> Result<Option<FrameReceiver>, TransportError> {
        Ok(None)
    }

    async fn send(&mut self, request: WireRequest) -> Result<Option<String>, TransportError> {
        let WireRequest::Json(body) = request else {
            return Err(TransportError::Protocol("cors requests must be json".into()));
        };
        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }
        let text = response.text().await?;
        histogram!(ROUNDTRIP_SECONDS, "transport" => "cors")
            .record(started.elapsed().as_secs_f64());
        debug!(endpoint = %self.endpoint, %status, bytes = text.len(), "cors reply");
        Ok(Some(text))
    }

    async fn close(&mut self) {}
}
