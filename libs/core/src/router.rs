//! Translation between the internal message shapes and each transport's wire format.

use metrics::counter;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use crate::config::TransportKind;
use crate::message::{NormalizedMessage, Sender};
use crate::protocol::{
    BackendError, HandshakeReply, Inbound, JsonpRequest, Outbound, Severity, WireRequest,
};
use crate::session::{InstanceId, SessionKey};
use crate::telemetry::INBOUND_DROPPED;
use crate::widget::WidgetPayload;

#[derive(Debug)]
pub struct MessageRouter {
    instance_id: InstanceId,
    transport: TransportKind,
    callback_seq: u64,
}

impl MessageRouter {
    pub fn new(instance_id: InstanceId, transport: TransportKind) -> Self {
        Self {
            instance_id,
            transport,
            callback_seq: 0,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn encode(&mut self, outbound: &Outbound, session_key: Option<&SessionKey>) -> WireRequest {
        let body = json_body(outbound, session_key);
        match self.transport {
            TransportKind::WebSocket | TransportKind::Cors => WireRequest::Json(body),
            TransportKind::Jsonp => WireRequest::Jsonp(self.jsonp_request(body)),
        }
    }

    fn jsonp_request(&mut self, body: Value) -> JsonpRequest {
        self.callback_seq += 1;
        // Callback names have to be valid script identifiers.
        let namespace: String = self
            .instance_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let callback = format!("gcw_{namespace}_{}", self.callback_seq);

        let params = match body {
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (key, value)
                })
                .collect(),
            _ => Vec::new(),
        };
        JsonpRequest { callback, params }
    }

    /// Decodes the reply correlated with `request` (CORS and JSONP transports).
    pub fn decode_reply(&self, request: &WireRequest, body: &str) -> Option<Inbound> {
        match request {
            WireRequest::Json(_) => self.decode_text(body),
            WireRequest::Jsonp(jsonp) => match unwrap_jsonp(&jsonp.callback, body) {
                Ok(inner) => self.decode_text(inner),
                Err(reason) => {
                    drop_payload("jsonp_wrapper", reason);
                    None
                }
            },
        }
    }

    /// Decodes a pushed frame or an unwrapped reply body.
    pub fn decode_text(&self, raw: &str) -> Option<Inbound> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Some(Inbound::Ack { session_key: None });
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.decode_value(&value),
            Err(err) => {
                drop_payload("malformed_json", &err.to_string());
                None
            }
        }
    }

    pub fn decode_value(&self, value: &Value) -> Option<Inbound> {
        let Some(obj) = value.as_object() else {
            drop_payload("not_an_object", "reply is not a json object");
            return None;
        };
        let session_key = string_field(obj, "sessionKey").and_then(SessionKey::parse);
        let kind = obj.get("type").and_then(Value::as_str);

        let inbound = match kind {
            Some("handshake") => handshake(obj, session_key),
            None if obj.contains_key("status") => handshake(obj, session_key),
            Some("error") => Inbound::Error(BackendError {
                message: string_field(obj, "message")
                    .or_else(|| string_field(obj, "text"))
                    .unwrap_or_else(|| "The assistant reported an error.".to_string()),
                severity: severity(obj),
                session_key,
            }),
            Some("typing") => Inbound::Typing {
                typing: typing_flag(obj),
                session_key,
            },
            Some("read") | Some("receipt") | Some("read_receipt") => Inbound::Receipt {
                message_id: string_field(obj, "messageId").or_else(|| string_field(obj, "id")),
            },
            Some("ack") => Inbound::Ack { session_key },
            Some("message") | Some("connect") | Some("greeting") | None => {
                match self.message(obj, session_key.clone()) {
                    Some(message) => Inbound::Message(message),
                    None => Inbound::Ack { session_key },
                }
            }
            Some(other) => {
                drop_payload("unknown_type", other);
                return None;
            }
        };
        Some(inbound)
    }

    fn message(
        &self,
        obj: &Map<String, Value>,
        session_key: Option<SessionKey>,
    ) -> Option<NormalizedMessage> {
        let text = obj
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let widget = obj
            .get("widget")
            .filter(|value| !value.is_null())
            .and_then(|raw| match WidgetPayload::from_value(raw) {
                Ok(payload) => Some(payload),
                Err(err) => {
                    counter!(
                        INBOUND_DROPPED,
                        "reason" => "invalid_widget",
                        "transport" => self.transport.as_str()
                    )
                    .increment(1);
                    warn!(
                        instance_id = %self.instance_id,
                        error = %err,
                        "dropping invalid widget payload"
                    );
                    None
                }
            });

        if text.trim().is_empty() && widget.is_none() {
            debug!(instance_id = %self.instance_id, "empty message treated as ack");
            return None;
        }

        let sender = match obj.get("sender").and_then(Value::as_str) {
            Some("user") => Sender::User,
            _ => Sender::Bot,
        };
        let mut message = NormalizedMessage::bot(text, widget, session_key)
            .with_timestamp(timestamp(obj.get("timestamp")));
        message.sender = sender;
        if let Some(id) = string_field(obj, "id") {
            message = message.with_id(id);
        }
        Some(message)
    }
}

fn json_body(outbound: &Outbound, session_key: Option<&SessionKey>) -> Value {
    let mut body = match outbound {
        Outbound::Handshake => json!({"type": "handshake"}),
        Outbound::Connect => json!({"type": "connect"}),
        Outbound::Message { text } => json!({"type": "message", "text": text}),
        Outbound::Typing { typing } => json!({"type": "typing", "payload": {"typing": typing}}),
        Outbound::WidgetInteraction(event) => json!({
            "type": "message",
            "text": event.option_value,
            "interaction": {
                "widgetId": event.widget_id,
                "optionId": event.option_id,
                "optionValue": event.option_value,
                "optionText": event.option_text,
                "widgetType": event.widget_type,
            }
        }),
    };
    if let (Some(key), Some(map)) = (session_key, body.as_object_mut()) {
        map.insert("sessionKey".into(), Value::String(key.as_str().to_string()));
    }
    body
}

/// Strips the `callback(...)` wrapper from a JSONP reply.
pub fn unwrap_jsonp<'a>(callback: &str, body: &'a str) -> Result<&'a str, &'static str> {
    let trimmed = body.trim().trim_end_matches(';').trim_end();
    let rest = trimmed
        .strip_prefix(callback)
        .ok_or("reply is addressed to a different callback")?;
    let inner = rest
        .trim_start()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or("reply is not a callback invocation")?;
    Ok(inner)
}

fn handshake(obj: &Map<String, Value>, session_key: Option<SessionKey>) -> Inbound {
    Inbound::Handshake(HandshakeReply {
        status: string_field(obj, "status").unwrap_or_else(|| "success".to_string()),
        session_key,
        message: string_field(obj, "message").filter(|text| !text.trim().is_empty()),
    })
}

fn severity(obj: &Map<String, Value>) -> Severity {
    match obj
        .get("severity")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("warning") | Some("warn") => Severity::Warning,
        Some("info") | Some("debug") => Severity::Info,
        _ => Severity::Error,
    }
}

fn typing_flag(obj: &Map<String, Value>) -> bool {
    obj.get("payload")
        .and_then(|payload| payload.get("typing"))
        .or_else(|| obj.get("typing"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn timestamp(raw: Option<&Value>) -> OffsetDateTime {
    match raw {
        Some(Value::String(text)) => OffsetDateTime::parse(text, &Rfc3339).ok(),
        Some(Value::Number(millis)) => millis
            .as_i64()
            .and_then(|ms| OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()),
        _ => None,
    }
    .unwrap_or_else(OffsetDateTime::now_utc)
}

fn string_field(obj: &Map<String, Value>, name: &str) -> Option<String> {
    obj.get(name).and_then(Value::as_str).map(str::to_string)
}

fn drop_payload(reason: &'static str, detail: &str) {
    counter!(INBOUND_DROPPED, "reason" => reason).increment(1);
    warn!(reason, detail, "dropping unrecognized inbound payload");
}
