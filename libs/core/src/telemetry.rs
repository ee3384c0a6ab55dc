//! Metric names and span helpers shared by the core and the hosts that install
//! a recorder.

use tracing::Span;

use crate::config::TransportKind;
use crate::session::InstanceId;

/// Connect attempts, labelled by `transport`.
pub const TRANSPORT_ATTEMPTS: &str = "chatwidget_transport_attempts_total";
/// Failed connect attempts, labelled by `transport`.
pub const TRANSPORT_FAILURES: &str = "chatwidget_transport_failures_total";
/// Inbound payloads dropped by the router, labelled by `reason`.
pub const INBOUND_DROPPED: &str = "chatwidget_inbound_dropped_total";
/// Accepted widget interactions, labelled by `widget_type`.
pub const WIDGET_INTERACTIONS: &str = "chatwidget_widget_interactions_total";
/// Request/response round trips, labelled by `transport`.
pub const ROUNDTRIP_SECONDS: &str = "chatwidget_roundtrip_seconds";

/// Records the instance and transport on a span declared with empty
/// `instance_id` and `transport` fields.
pub fn with_instance_fields(span: &Span, instance_id: &InstanceId, transport: Option<TransportKind>) {
    span.record("instance_id", tracing::field::display(instance_id));
    if let Some(transport) = transport {
        span.record("transport", transport.as_str());
    }
}
