use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::TransportKind;
use crate::session::InstanceId;
use crate::transport::TransportState;
use crate::widget::InteractionEvent;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub fn interaction(instance_id: &InstanceId) -> Self {
        Self::scoped(instance_id, "interaction")
    }

    pub fn connectivity(instance_id: &InstanceId) -> Self {
        Self::scoped(instance_id, "connectivity")
    }

    fn scoped(instance_id: &InstanceId, topic: &str) -> Self {
        Self(format!(
            "chatwidget.{instance}.{topic}",
            instance = instance_id.as_str().to_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this subject belongs to `instance_id`.
    pub fn is_for(&self, instance_id: &InstanceId) -> bool {
        self.0
            .strip_prefix("chatwidget.")
            .and_then(|rest| rest.strip_prefix(&instance_id.as_str().to_lowercase()))
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityEvent {
    pub instance_id: InstanceId,
    pub state: TransportState,
    pub transport: Option<TransportKind>,
    pub degraded: bool,
}

/// Events an instance announces to the rest of the host.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum PageEvent {
    Interaction(InteractionEvent),
    Connectivity(ConnectivityEvent),
}

impl PageEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            PageEvent::Interaction(event) => &event.instance_id,
            PageEvent::Connectivity(event) => &event.instance_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub subject: Subject,
    pub event: PageEvent,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &Subject, event: &PageEvent) -> Result<(), BusError>;
}

/// In-process bus shared by every instance in one host.
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, subject: &Subject, event: &PageEvent) -> Result<(), BusError> {
        let envelope = Envelope {
            subject: subject.clone(),
            event: event.clone(),
        };
        // No subscribers is not an error; the host may not listen at all.
        match self.sender.send(envelope) {
            Ok(receivers) => {
                debug!(
                    target: "chatwidget.bus",
                    subject = subject.as_str(),
                    receivers,
                    "event published"
                );
            }
            Err(_) => {
                debug!(
                    target: "chatwidget.bus",
                    subject = subject.as_str(),
                    "no subscribers for event"
                );
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct NoopBus;

#[async_trait]
impl EventBus for NoopBus {
    async fn publish(&self, subject: &Subject, _event: &PageEvent) -> Result<(), BusError> {
        debug!(
            target: "chatwidget.bus",
            subject = subject.as_str(),
            "dropping event (noop bus)"
        );
        Ok(())
    }
}

pub type SharedBus = Arc<dyn EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_scoped_by_instance() {
        let left = InstanceId::from_name("gcw-Left");
        let right = InstanceId::from_name("gcw-left2");
        let subject = Subject::connectivity(&left);
        assert_eq!(subject.as_str(), "chatwidget.gcw-left.connectivity");
        assert!(subject.is_for(&left));
        assert!(!subject.is_for(&right));
    }

    #[tokio::test]
    async fn broadcast_bus_delivers_to_every_subscriber() {
        let bus = BroadcastBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let instance = InstanceId::from_name("gcw-a");
        let event = PageEvent::Connectivity(ConnectivityEvent {
            instance_id: instance.clone(),
            state: TransportState::Connected,
            transport: Some(TransportKind::Cors),
            degraded: false,
        });

        bus.publish(&Subject::connectivity(&instance), &event)
            .await
            .unwrap();

        assert_eq!(first.recv().await.unwrap().event, event);
        let envelope = second.recv().await.unwrap();
        assert_eq!(envelope.event.instance_id(), &instance);
        assert!(envelope.subject.is_for(&instance));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = BroadcastBus::new();
        let instance = InstanceId::from_name("gcw-a");
        let event = PageEvent::Connectivity(ConnectivityEvent {
            instance_id: instance.clone(),
            state: TransportState::Failed,
            transport: None,
            degraded: true,
        });
        assert!(
            bus.publish(&Subject::connectivity(&instance), &event)
                .await
                .is_ok()
        );
        assert!(
            NoopBus
                .publish(&Subject::interaction(&instance), &event)
                .await
                .is_ok()
        );
    }
}
