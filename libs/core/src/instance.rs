//! The chat instance: one session, one connection, one message log.

use std::collections::{HashMap, VecDeque};

use metrics::counter;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::bus::{ConnectivityEvent, PageEvent, SharedBus, Subject};
use crate::config::{ConnectionDescriptor, TransportKind};
use crate::error::ChatError;
use crate::message::NormalizedMessage;
use crate::protocol::{Inbound, Outbound, Severity};
use crate::session::{InstanceId, SessionContext, SessionKey, UiState};
use crate::telemetry::WIDGET_INTERACTIONS;
use crate::transport::{ConnectionEvent, ConnectionSelector, TransportConnection, TransportState};
use crate::widget::{
    SubmitOutcome, WidgetId, WidgetInput, WidgetInteractionEngine, WidgetInteractionState,
};

/// A log entry and the widget rendered with it, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggedMessage {
    pub message: NormalizedMessage,
    pub widget_id: Option<WidgetId>,
}

pub struct ChatInstance {
    descriptor: ConnectionDescriptor,
    selector: ConnectionSelector,
    session: SessionContext,
    bus: SharedBus,
    connection: Option<TransportConnection>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    log: VecDeque<LoggedMessage>,
    widgets: HashMap<WidgetId, WidgetInteractionEngine>,
    outbox: VecDeque<Outbound>,
    widget_seq: u64,
    unread: usize,
    typing: bool,
    greeted: bool,
    state: TransportState,
    degraded: bool,
}

impl ChatInstance {
    /// Validates the descriptor and selects the transport. Nothing connects yet.
    pub fn new(descriptor: ConnectionDescriptor, bus: SharedBus) -> Result<Self, ChatError> {
        let selector = ConnectionSelector::new(&descriptor)?;
        let ui = if descriptor.presentation.start_open {
            UiState::Open
        } else {
            UiState::Closed
        };
        Ok(Self {
            session: SessionContext::new(InstanceId::generate(), ui),
            descriptor,
            selector,
            bus,
            connection: None,
            events: None,
            log: VecDeque::new(),
            widgets: HashMap::new(),
            outbox: VecDeque::new(),
            widget_seq: 0,
            unread: 0,
            typing: false,
            greeted: false,
            state: TransportState::Disconnected,
            degraded: false,
        })
    }

    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.session.instance_id = instance_id;
        self
    }

    /// Resumes a session whose key the host kept from an earlier run.
    pub fn with_session_key(mut self, key: SessionKey) -> Self {
        self.session = self.session.clone().with_session_key(key);
        self
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.selector = self.selector.with_client(client);
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.session.instance_id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.selector.kind()
    }

    /// Connects (handshake included), asks for the greeting once per instance
    /// and flushes anything queued while offline.
    #[instrument(name = "chatwidget.connect", skip(self), fields(instance_id = %self.session.instance_id))]
    pub async fn connect(&mut self) -> Result<(), ChatError> {
        if self.connection.is_none() {
            let (connection, events) = self
                .selector
                .spawn(self.session.instance_id.clone(), self.session.shared_key())?;
            self.connection = Some(connection);
            self.events = Some(events);
        }
        let outcome = match &self.connection {
            Some(connection) => connection.connect().await,
            None => return Err(ChatError::NotConnected(self.state)),
        };
        self.pump().await;
        outcome?;

        if self.descriptor.presentation.greet_on_connect && !self.greeted {
            self.dispatch(Outbound::Connect).await?;
            self.greeted = true;
        }
        self.pump().await;
        Ok(())
    }

    /// Replaces the connection with a fresh one. Required after `Failed`.
    pub async fn reconnect(&mut self) -> Result<(), ChatError> {
        info!(instance_id = %self.session.instance_id, "reconnect requested");
        self.drop_connection().await;
        self.connect().await
    }

    #[instrument(name = "chatwidget.send_text", skip(self, text), fields(instance_id = %self.session.instance_id))]
    pub async fn send_text(&mut self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.pump().await;
        match self.state {
            TransportState::Connected
            | TransportState::Connecting
            | TransportState::Reconnecting => {}
            state => return Err(ChatError::NotConnected(state)),
        }

        self.append(NormalizedMessage::user(text, self.session.session_key()));
        let outbound = Outbound::message(text);
        if self.state.is_pending() {
            debug!(queued = self.outbox.len() + 1, "queued message until reconnected");
            self.outbox.push_back(outbound);
            return Ok(());
        }
        self.dispatch(outbound).await
    }

    /// Typing signals are never logged and never queued.
    pub async fn set_typing(&mut self, typing: bool) -> Result<(), ChatError> {
        self.pump().await;
        if self.state != TransportState::Connected {
            return Err(ChatError::NotConnected(self.state));
        }
        self.dispatch(Outbound::Typing { typing }).await
    }

    /// Routes one user interaction to its widget. An accepted interaction is
    /// published on the bus, echoed into the log and sent to the backend.
    #[instrument(name = "chatwidget.submit_widget", skip(self, input), fields(instance_id = %self.session.instance_id))]
    pub async fn submit_widget(
        &mut self,
        widget_id: &WidgetId,
        input: impl Into<WidgetInput>,
    ) -> Result<SubmitOutcome, ChatError> {
        let engine = self
            .widgets
            .get_mut(widget_id)
            .ok_or_else(|| ChatError::UnknownWidget(widget_id.to_string()))?;
        let outcome = engine.submit(input);
        let SubmitOutcome::Accepted(event) = &outcome else {
            return Ok(outcome);
        };

        counter!(
            WIDGET_INTERACTIONS,
            "widget_type" => event.widget_type.as_str()
        )
        .increment(1);
        self.publish(
            Subject::interaction(&self.session.instance_id),
            PageEvent::Interaction(event.clone()),
        )
        .await;
        self.append(NormalizedMessage::user(
            event.option_text.clone(),
            self.session.session_key(),
        ));

        let outbound = Outbound::WidgetInteraction(event.clone());
        self.pump().await;
        if self.state == TransportState::Connected {
            self.dispatch(outbound).await?;
        } else {
            // The widget is already disabled; the interaction waits for the next connection.
            debug!(state = %self.state, "queued widget interaction");
            self.outbox.push_back(outbound);
        }
        Ok(outcome)
    }

    /// Applies every connection event already received, in arrival order.
    /// Returns how many were applied.
    pub async fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            while let Some(event) = self.events.as_mut().and_then(|events| events.try_recv().ok()) {
                self.apply(event).await;
                applied += 1;
            }
            if self.state != TransportState::Connected || self.outbox.is_empty() {
                break;
            }
            self.flush_outbox().await;
        }
        applied
    }

    /// Waits for the next connection event and applies it. `None` once the
    /// connection is closed.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.events.as_mut()?.recv().await?;
        self.apply(event.clone()).await;
        if self.state == TransportState::Connected && !self.outbox.is_empty() {
            self.flush_outbox().await;
        }
        Some(event)
    }

    pub fn open_ui(&mut self) {
        if self.session.set_ui(UiState::Open) {
            debug!(instance_id = %self.session.instance_id, "chat opened");
        }
        self.unread = 0;
    }

    pub fn close_ui(&mut self) {
        if self.session.set_ui(UiState::Closed) {
            debug!(instance_id = %self.session.instance_id, "chat closed");
        }
    }

    pub fn toggle_ui(&mut self) -> UiState {
        match self.session.ui() {
            UiState::Open => self.close_ui(),
            UiState::Closed => self.open_ui(),
        }
        self.session.ui()
    }

    /// Tears down the connection. Nothing it still had in flight reaches this
    /// instance afterwards.
    pub async fn close(&mut self) {
        self.drop_connection().await;
        self.outbox.clear();
    }

    pub fn log(&self) -> impl ExactSizeIterator<Item = &LoggedMessage> {
        self.log.iter()
    }

    pub fn messages(&self) -> impl ExactSizeIterator<Item = &NormalizedMessage> {
        self.log.iter().map(|entry| &entry.message)
    }

    pub fn widget(&self, widget_id: &WidgetId) -> Option<&WidgetInteractionEngine> {
        self.widgets.get(widget_id)
    }

    pub fn widget_state(&self, widget_id: &WidgetId) -> Option<WidgetInteractionState> {
        self.widgets.get(widget_id).map(WidgetInteractionEngine::state)
    }

    /// Widget of the most recent message that carries one.
    pub fn latest_widget(&self) -> Option<&WidgetId> {
        self.log.iter().rev().find_map(|entry| entry.widget_id.as_ref())
    }

    pub fn transport_state(&self) -> TransportState {
        self.state
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.session.session_key()
    }

    pub fn ui_state(&self) -> UiState {
        self.session.ui()
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    async fn dispatch(&mut self, outbound: Outbound) -> Result<(), ChatError> {
        let Some(connection) = &self.connection else {
            return Err(ChatError::NotConnected(self.state));
        };
        let reply = connection.send(outbound).await;
        // State changes from a reconnect cycle come before the reply.
        self.drain_events().await;
        if let Some(inbound) = reply? {
            self.apply_inbound(inbound).await;
        }
        Ok(())
    }

    async fn flush_outbox(&mut self) {
        while let Some(outbound) = self.outbox.pop_front() {
            let Some(connection) = &self.connection else {
                self.outbox.push_front(outbound);
                return;
            };
            match connection.send(outbound.clone()).await {
                Ok(Some(inbound)) => self.apply_inbound(inbound).await,
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        instance_id = %self.session.instance_id,
                        kind = outbound.kind().as_str(),
                        error = %err,
                        "queued message not delivered"
                    );
                    self.outbox.push_front(outbound);
                    return;
                }
            }
        }
    }

    async fn drain_events(&mut self) {
        while let Some(event) = self.events.as_mut().and_then(|events| events.try_recv().ok()) {
            self.apply(event).await;
        }
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::State(state) => self.apply_state(state).await,
            ConnectionEvent::Inbound(inbound) => self.apply_inbound(inbound).await,
        }
    }

    async fn apply_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        self.state = state;
        match state {
            TransportState::Failed => self.degraded = true,
            TransportState::Connected => self.degraded = false,
            _ => {}
        }
        if state == TransportState::Failed {
            warn!(instance_id = %self.session.instance_id, "connection failed, chat degraded");
        }
        self.publish(
            Subject::connectivity(&self.session.instance_id),
            PageEvent::Connectivity(ConnectivityEvent {
                instance_id: self.session.instance_id.clone(),
                state,
                transport: Some(self.selector.kind()),
                degraded: self.degraded,
            }),
        )
        .await;
    }

    async fn apply_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Handshake(reply) => {
                if let Some(text) = reply.message {
                    self.append(NormalizedMessage::bot(text, None, reply.session_key));
                }
            }
            Inbound::Message(message) => {
                self.typing = false;
                self.append(message);
            }
            Inbound::Typing { typing, .. } => self.typing = typing,
            Inbound::Receipt { message_id } => {
                debug!(instance_id = %self.session.instance_id, ?message_id, "read receipt");
            }
            Inbound::Error(error) => match error.severity {
                Severity::Error => {
                    self.typing = false;
                    self.append(NormalizedMessage::bot(error.message, None, error.session_key));
                }
                Severity::Warning => {
                    warn!(instance_id = %self.session.instance_id, message = %error.message, "backend warning");
                }
                Severity::Info => {
                    info!(instance_id = %self.session.instance_id, message = %error.message, "backend notice");
                }
            },
            Inbound::Ack { .. } => {}
        }
    }

    fn append(&mut self, message: NormalizedMessage) {
        let widget_id = message.widget.clone().and_then(|payload| {
            self.widget_seq += 1;
            let id = WidgetId::new(
                self.session
                    .instance_id
                    .scoped(&format!("widget-{}", self.widget_seq)),
            );
            match WidgetInteractionEngine::new(id.clone(), self.session.instance_id.clone(), payload) {
                Ok(engine) => {
                    self.widgets.insert(id.clone(), engine);
                    Some(id)
                }
                Err(err) => {
                    warn!(instance_id = %self.session.instance_id, error = %err, "widget not rendered");
                    None
                }
            }
        });

        if message.is_from_bot() && self.session.ui() == UiState::Closed {
            self.unread += 1;
        }
        self.log.push_back(LoggedMessage { message, widget_id });

        let max = self.descriptor.presentation.max_history.max(1);
        while self.log.len() > max {
            if let Some(evicted) = self.log.pop_front()
                && let Some(id) = evicted.widget_id
            {
                self.widgets.remove(&id);
            }
        }
    }

    /// The closed connection reports nothing more, so the instance publishes
    /// its own `disconnected` transition.
    async fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.events = None;
        self.typing = false;
        self.apply_state(TransportState::Disconnected).await;
    }

    async fn publish(&self, subject: Subject, event: PageEvent) {
        if let Err(err) = self.bus.publish(&subject, &event).await {
            warn!(subject = subject.as_str(), error = %err, "failed to publish page event");
        }
    }
}
