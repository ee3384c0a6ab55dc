//! Greentic chat widget client core.
//!
//! This crate holds everything an embedded chat surface needs below its view
//! layer: transport selection and reconnection, the wire protocol, the
//! interactive widget state machine and the [`ChatInstance`] that ties them
//! together. Instances in one host share nothing but the page [`bus`].
pub mod backoff;
pub mod bus;
pub mod config;
pub mod error;
pub mod instance;
pub mod message;
pub mod protocol;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod widget;

pub use backoff::Backoff;
pub use bus::{
    BroadcastBus, BusError, ConnectivityEvent, Envelope, EventBus, NoopBus, PageEvent, SharedBus,
    Subject,
};
pub use config::{ConnectionDescriptor, Presentation, RetryPolicy, Timeouts, TransportKind};
pub use error::{ChatError, ConfigError, ConnectionError, PayloadError, TransportError};
pub use instance::{ChatInstance, LoggedMessage};
pub use message::{NormalizedMessage, Sender};
pub use protocol::{BackendError, HandshakeReply, Inbound, Outbound, Severity, WireRequest};
pub use router::MessageRouter;
pub use session::{InstanceId, SessionContext, SessionKey, SharedSessionKey, UiState};
pub use transport::{
    ConnectionEvent, ConnectionSelector, ConnectionSettings, Transport, TransportConnection,
    TransportState,
};
pub use widget::{
    InteractionEvent, RejectReason, SubmitOutcome, WidgetId, WidgetInput,
    WidgetInteractionEngine, WidgetInteractionState, WidgetKind, WidgetPayload,
};
