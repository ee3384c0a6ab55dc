use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{FrameReceiver, Transport, TransportState};
use crate::backoff::Backoff;
use crate::config::{RetryPolicy, Timeouts, TransportKind};
use crate::error::{ConnectionError, TransportError};
use crate::protocol::{HandshakeReply, Inbound, Outbound, WireRequest};
use crate::router::MessageRouter;
use crate::session::SharedSessionKey;
use crate::telemetry::{TRANSPORT_ATTEMPTS, TRANSPORT_FAILURES};

#[derive(Clone, Debug, Default)]
pub struct ConnectionSettings {
    pub timeouts: Timeouts,
    pub retry_policy: RetryPolicy,
}

/// Everything a connection reports to its owner, in the order it happened.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    State(TransportState),
    Inbound(Inbound),
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectionError>>),
    Send {
        outbound: Outbound,
        reply: oneshot::Sender<Result<Option<Inbound>, ConnectionError>>,
    },
}

impl Command {
    fn reject(self, err: ConnectionError) {
        match self {
            Command::Connect(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Handle to a transport driven by its own task.
///
/// Commands are processed strictly in submission order, so a send issued while an
/// attempt cycle is running waits for that cycle and is written once connected.
/// Dropping the handle closes the connection.
pub struct TransportConnection {
    kind: TransportKind,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TransportState>,
    cancel: CancellationToken,
}

impl TransportConnection {
    pub fn spawn(
        transport: Box<dyn Transport>,
        router: MessageRouter,
        session_key: SharedSessionKey,
        settings: ConnectionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let kind = transport.kind();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);
        let cancel = CancellationToken::new();

        let span = info_span!(
            "chat_connection",
            instance_id = %router.instance_id(),
            transport = kind.as_str()
        );
        let driver = Driver {
            transport,
            router,
            session_key,
            backoff: Backoff::new(settings.retry_policy),
            settings,
            state: state_tx,
            events: events_tx,
            frames: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run(commands_rx).instrument(span));

        (
            Self {
                kind,
                commands: commands_tx,
                state: state_rx,
                cancel,
            },
            events_rx,
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    /// Resolves once connected, or with the outcome of the attempt cycle.
    /// Never starts a second cycle while one is running.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply))
            .map_err(|_| ConnectionError::Closed)?;
        outcome.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Sends one outbound message. Request/response transports return the
    /// correlated reply; WebSocket replies arrive as events instead.
    pub async fn send(&self, outbound: Outbound) -> Result<Option<Inbound>, ConnectionError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send { outbound, reply })
            .map_err(|_| ConnectionError::Closed)?;
        outcome.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Cancels any attempt, backoff sleep or reply wait in flight. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    transport: Box<dyn Transport>,
    router: MessageRouter,
    session_key: SharedSessionKey,
    settings: ConnectionSettings,
    backoff: Backoff,
    state: watch::Sender<TransportState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    frames: Option<FrameReceiver>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                frame = next_frame(&mut self.frames) => match frame {
                    Some(text) => self.on_frame(&text),
                    None => self.on_drop().await,
                },
            }
        }
        self.shutdown(&mut commands).await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let outcome = match self.current() {
                    TransportState::Connected => Ok(()),
                    TransportState::Failed => Err(ConnectionError::Failed),
                    _ => self.establish(TransportState::Connecting).await,
                };
                let _ = reply.send(outcome);
            }
            Command::Send { outbound, reply } => {
                let outcome = self.send(outbound).await;
                let _ = reply.send(outcome);
            }
        }
    }

    /// Runs attempts until one succeeds, retries are exhausted or the
    /// connection is closed.
    async fn establish(&mut self, entry: TransportState) -> Result<(), ConnectionError> {
        self.set_state(entry);
        let cancel = self.cancel.clone();
        loop {
            counter!(
                TRANSPORT_ATTEMPTS,
                "transport" => self.router.transport().as_str()
            )
            .increment(1);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Closed),
                attempt = self.attempt() => attempt,
            };

            let err = match attempt {
                Ok(()) => {
                    self.backoff.reset();
                    self.set_state(TransportState::Connected);
                    return Ok(());
                }
                Err(err) => err,
            };

            counter!(
                TRANSPORT_FAILURES,
                "transport" => self.router.transport().as_str()
            )
            .increment(1);
            let delay = self.backoff.on_failure();
            if self.backoff.exhausted() {
                warn!(
                    failures = self.backoff.failures(),
                    error = %err,
                    "giving up on transport"
                );
                self.transport.close().await;
                self.frames = None;
                self.set_state(TransportState::Failed);
                return Err(ConnectionError::Failed);
            }

            debug!(
                failures = self.backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "connect attempt failed, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
            // Retries re-enter `connecting`; `reconnecting` only follows a drop.
            self.set_state(TransportState::Connecting);
        }
    }

    /// One open plus handshake exchange.
    async fn attempt(&mut self) -> Result<(), TransportError> {
        self.transport.close().await;
        self.frames = None;

        let connect_after = self.settings.timeouts.connect;
        let frames = timeout(connect_after, self.transport.open())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                after: connect_after,
            })??;

        let request = self
            .router
            .encode(&Outbound::Handshake, self.session_key.get().as_ref());
        let request_after = self.settings.timeouts.request;
        let handshake_timeout = || TransportError::Timeout {
            operation: "handshake",
            after: request_after,
        };

        let reply = match frames {
            Some(mut frames) => {
                timeout(request_after, self.transport.send(request))
                    .await
                    .map_err(|_| handshake_timeout())??;
                let reply = timeout(request_after, self.await_handshake(&mut frames))
                    .await
                    .map_err(|_| handshake_timeout())??;
                self.frames = Some(frames);
                reply
            }
            None => {
                let body = timeout(request_after, self.transport.send(request.clone()))
                    .await
                    .map_err(|_| handshake_timeout())??
                    .ok_or_else(|| TransportError::Protocol("handshake got no reply".into()))?;
                match self.router.decode_reply(&request, &body) {
                    Some(Inbound::Handshake(reply)) => reply,
                    _ => {
                        return Err(TransportError::Protocol(
                            "reply is not a handshake".into(),
                        ));
                    }
                }
            }
        };

        if !reply.is_success() {
            return Err(TransportError::Protocol(format!(
                "handshake rejected with status `{}`",
                reply.status
            )));
        }
        if let Some(key) = &reply.session_key {
            self.session_key.adopt(key.clone());
        }
        self.emit(ConnectionEvent::Inbound(Inbound::Handshake(reply)));
        Ok(())
    }

    /// Frames that arrive ahead of the handshake reply are delivered in order.
    async fn await_handshake(
        &self,
        frames: &mut FrameReceiver,
    ) -> Result<HandshakeReply, TransportError> {
        while let Some(text) = frames.recv().await {
            match self.router.decode_text(&text) {
                Some(Inbound::Handshake(reply)) => return Ok(reply),
                Some(other) => self.deliver(other),
                None => {}
            }
        }
        Err(TransportError::Dropped)
    }

    async fn send(&mut self, outbound: Outbound) -> Result<Option<Inbound>, ConnectionError> {
        let cancel = self.cancel.clone();
        loop {
            match self.current() {
                TransportState::Connected => {}
                TransportState::Failed => return Err(ConnectionError::Failed),
                state => return Err(ConnectionError::NotConnected(state)),
            }
            // Re-encoded on every pass so a resumed session carries the latest key.
            let request = self
                .router
                .encode(&outbound, self.session_key.get().as_ref());
            let exchanged = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Closed),
                exchanged = self.exchange(request) => exchanged,
            };
            match exchanged {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(
                        kind = outbound.kind().as_str(),
                        error = %err,
                        "send failed, reconnecting"
                    );
                    self.establish(TransportState::Reconnecting).await?;
                }
            }
        }
    }

    async fn exchange(&mut self, request: WireRequest) -> Result<Option<Inbound>, TransportError> {
        let after = self.settings.timeouts.request;
        let body = timeout(after, self.transport.send(request.clone()))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "request",
                after,
            })??;
        let Some(body) = body else {
            return Ok(None);
        };
        let inbound = self.router.decode_reply(&request, &body);
        if let Some(key) = inbound.as_ref().and_then(Inbound::session_key) {
            self.session_key.adopt(key.clone());
        }
        Ok(inbound)
    }

    fn on_frame(&self, text: &str) {
        if let Some(inbound) = self.router.decode_text(text) {
            self.deliver(inbound);
        }
    }

    async fn on_drop(&mut self) {
        self.frames = None;
        if self.current() != TransportState::Connected {
            return;
        }
        info!("transport dropped, reconnecting");
        // The outcome is visible through the state change.
        let _ = self.establish(TransportState::Reconnecting).await;
    }

    fn deliver(&self, inbound: Inbound) {
        if let Some(key) = inbound.session_key() {
            self.session_key.adopt(key.clone());
        }
        self.emit(ConnectionEvent::Inbound(inbound));
    }

    fn current(&self) -> TransportState {
        *self.state.borrow()
    }

    fn set_state(&self, next: TransportState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = next.as_str(), "transport state changed");
            self.emit(ConnectionEvent::State(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // Nothing reaches the owner once it closed the connection.
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        self.transport.close().await;
        self.frames = None;
        self.set_state(TransportState::Disconnected);
        commands.close();
        while let Ok(command) = commands.try_recv() {
            command.reject(ConnectionError::Closed);
        }
        debug!("connection task finished");
    }
}

async fn next_frame(frames: &mut Option<FrameReceiver>) -> Option<String> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}
