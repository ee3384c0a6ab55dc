//! Test harness for the chat widget: an in-process backend speaking the widget
//! protocol over WebSocket, JSON POST and JSONP, with failure injection.

mod backend;

pub use backend::{Responder, TestBackend};

use std::net::SocketAddr;

/// An address nothing listens on, for exercising connect failures.
pub async fn unused_addr() -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}
