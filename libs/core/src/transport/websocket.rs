use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{FrameReceiver, Transport};
use crate::config::TransportKind;
use crate::error::TransportError;
use crate::protocol::WireRequest;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Persistent socket; replies arrive as pushed frames.
pub struct WebSocketTransport {
    url: Url,
    writer: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            writer: None,
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&mut self) -> Result<Option<FrameReceiver>, TransportError> {
        self.close().await;
        debug!(url = %self.url, "opening websocket");
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (writer, mut reader) = stream.split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let url = self.url.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(url = %url, "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(url = %url, error = %err, "websocket read failed");
                        break;
                    }
                };
                if frames_tx.send(text).is_err() {
                    break;
                }
            }
            debug!(url = %url, "websocket reader finished");
        }));
        self.writer = Some(writer);
        info!(url = %self.url, "websocket open");
        Ok(Some(frames_rx))
    }

    async fn send(&mut self, request: WireRequest) -> Result<Option<String>, TransportError> {
        let WireRequest::Json(body) = request else {
            return Err(TransportError::Protocol(
                "websocket frames must be json".into(),
            ));
        };
        let writer = self.writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer.send(Message::Text(body.to_string().into())).await?;
        Ok(None)
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
