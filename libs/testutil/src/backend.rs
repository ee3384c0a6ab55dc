use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Custom answer for non-handshake requests; `None` falls back to the default echo.
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

const DEFAULT_SESSION_KEY: &str = "abc123";

#[derive(Clone, Debug)]
enum Control {
    Push(String),
    Drop,
}

struct BackendState {
    requests: Mutex<Vec<Value>>,
    hits: AtomicUsize,
    fail_next: AtomicUsize,
    outage_on: Mutex<Option<String>>,
    upgrades: AtomicUsize,
    session_key: Mutex<String>,
    handshake_message: Mutex<Option<String>>,
    responder: Mutex<Option<Responder>>,
    control: broadcast::Sender<Control>,
}

impl BackendState {
    /// Counts the hit and reports whether it has to fail.
    fn take_failure(&self) -> bool {
        self.hits.fetch_add(1, Ordering::SeqCst);
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    /// Starts the outage when `request` is of the armed type.
    fn starts_outage(&self, request: &Value) -> bool {
        let mut outage_on = lock(&self.outage_on);
        let kind = request.get("type").and_then(Value::as_str);
        if outage_on.is_none() || outage_on.as_deref() != kind {
            return false;
        }
        *outage_on = None;
        self.fail_next.store(usize::MAX, Ordering::SeqCst);
        true
    }

    fn reply(&self, request: Value) -> Value {
        lock(&self.requests).push(request.clone());
        let kind = request
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let key = request
            .get("sessionKey")
            .and_then(Value::as_str)
            .filter(|key| !key.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| lock(&self.session_key).clone());

        if kind == "handshake" {
            let mut reply = json!({"status": "success", "sessionKey": key});
            if let Some(message) = lock(&self.handshake_message).clone() {
                reply["message"] = Value::String(message);
            }
            return reply;
        }

        let responder = lock(&self.responder).clone();
        if let Some(mut reply) = responder.and_then(|responder| responder(&request)) {
            if let Some(map) = reply.as_object_mut() {
                map.entry("sessionKey").or_insert(Value::String(key));
            }
            return reply;
        }

        match kind.as_str() {
            "connect" => json!({
                "text": "Hello! How can I help?",
                "sender": "bot",
                "sessionKey": key,
            }),
            "message" => json!({
                "text": format!("echo: {}", request["text"].as_str().unwrap_or_default()),
                "sender": "bot",
                "sessionKey": key,
            }),
            "typing" => json!({"type": "ack", "sessionKey": key}),
            other => json!({
                "type": "error",
                "message": format!("unsupported request `{other}`"),
                "sessionKey": key,
            }),
        }
    }
}

/// Chat backend bound to an ephemeral localhost port.
///
/// `POST /chat` answers JSON, `GET /chat` answers JSONP and `GET /ws` upgrades to
/// a WebSocket. Handshakes resume the key they carry or issue `abc123`.
pub struct TestBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    server: JoinHandle<()>,
}

impl TestBackend {
    pub async fn start() -> Result<Self> {
        let (control, _) = broadcast::channel(64);
        let state = Arc::new(BackendState {
            requests: Mutex::new(Vec::new()),
            hits: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            outage_on: Mutex::new(None),
            upgrades: AtomicUsize::new(0),
            session_key: Mutex::new(DEFAULT_SESSION_KEY.to_string()),
            handshake_message: Mutex::new(None),
            responder: Mutex::new(None),
            control,
        });
        let app = Router::new()
            .route("/chat", get(jsonp_handler).post(json_handler))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "test backend stopped");
            }
        });
        debug!(%addr, "test backend listening");
        Ok(Self {
            addr,
            state,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn http_url(&self) -> String {
        format!("http://{}/chat", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Key handed out to handshakes that do not carry one.
    pub fn issue_session_key(&self, key: impl Into<String>) {
        *lock(&self.state.session_key) = key.into();
    }

    pub fn handshake_message(&self, message: impl Into<String>) {
        *lock(&self.state.handshake_message) = Some(message.into());
    }

    /// The next `count` hits on any endpoint answer 503.
    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// The first `POST /chat` request of type `kind` answers 503 and so does
    /// every hit after it, until `fail_next(0)`.
    pub fn outage_from(&self, kind: impl Into<String>) {
        *lock(&self.state.outage_on) = Some(kind.into());
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        *lock(&self.state.responder) = Some(Arc::new(responder));
    }

    /// Sends a raw frame to every open WebSocket. Returns how many sockets got it.
    pub fn push_frame(&self, frame: impl Into<String>) -> usize {
        self.state
            .control
            .send(Control::Push(frame.into()))
            .unwrap_or(0)
    }

    /// Drops every open WebSocket without a closing handshake.
    pub fn drop_websockets(&self) -> usize {
        self.state.control.send(Control::Drop).unwrap_or(0)
    }

    /// Requests that reached the protocol layer, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        lock(&self.state.requests).clone()
    }

    pub fn requests_of_type(&self, kind: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request["type"] == kind)
            .collect()
    }

    /// Every hit, failed ones included.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Polls until `count` WebSocket upgrades were accepted.
    pub async fn wait_for_upgrades(&self, count: usize) -> Result<()> {
        self.wait_until(|backend| backend.upgrades() >= count).await
    }

    pub async fn wait_for_requests(&self, count: usize) -> Result<()> {
        self.wait_until(|backend| backend.requests().len() >= count)
            .await
    }

    async fn wait_until(&self, done: impl Fn(&Self) -> bool) -> Result<()> {
        for _ in 0..500 {
            if done(self) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("test backend condition not reached within 5s")
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn json_handler(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<Value>,
) -> Response {
    if state.take_failure() || state.starts_outage(&body) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(state.reply(body)).into_response()
}

async fn jsonp_handler(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.take_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(callback) = params.get("callback").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing callback").into_response();
    };

    let mut body = Map::new();
    for (key, value) in params {
        if key == "callback" {
            continue;
        }
        let value = match key.as_str() {
            "payload" | "interaction" => {
                serde_json::from_str(&value).unwrap_or(Value::String(value))
            }
            _ => Value::String(value),
        };
        body.insert(key, value);
    }
    let reply = state.reply(Value::Object(body));
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        format!("{callback}({reply});"),
    )
        .into_response()
}

async fn ws_handler(State(state): State<Arc<BackendState>>, ws: WebSocketUpgrade) -> Response {
    if state.take_failure() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.upgrades.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| run_socket(socket, state))
}

async fn run_socket(mut socket: WebSocket, state: Arc<BackendState>) {
    let mut control = state.control.subscribe();
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(body) = serde_json::from_str::<Value>(text.as_str()) else {
                        debug!("ignoring non-json frame");
                        continue;
                    };
                    let reply = state.reply(body);
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(error = %err, "test socket read failed");
                    break;
                }
            },
            control = control.recv() => match control {
                Ok(Control::Push(frame)) => {
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Drop) | Err(_) => break,
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
