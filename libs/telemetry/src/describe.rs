use gcw_core::telemetry::{
    INBOUND_DROPPED, ROUNDTRIP_SECONDS, TRANSPORT_ATTEMPTS, TRANSPORT_FAILURES,
    WIDGET_INTERACTIONS,
};
use metrics::{Unit, describe_counter, describe_histogram};

/// Registers descriptions for every metric the core records. Call after the
/// host installed its recorder; without one this does nothing.
pub fn describe_metrics() {
    describe_counter!(
        TRANSPORT_ATTEMPTS,
        Unit::Count,
        "Connect attempts, handshake included"
    );
    describe_counter!(
        TRANSPORT_FAILURES,
        Unit::Count,
        "Connect attempts that failed"
    );
    describe_counter!(
        INBOUND_DROPPED,
        Unit::Count,
        "Inbound payloads dropped as malformed or unrecognized"
    );
    describe_counter!(
        WIDGET_INTERACTIONS,
        Unit::Count,
        "Widget interactions accepted"
    );
    describe_histogram!(
        ROUNDTRIP_SECONDS,
        Unit::Seconds,
        "Request/response round trip"
    );
}
