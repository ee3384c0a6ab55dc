use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{WidgetKind, WidgetPayload, compile_pattern};
use crate::error::PayloadError;
use crate::session::InstanceId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetInteractionState {
    Pending,
    Submitted,
    Disabled,
}

/// Raised exactly once per widget, when its pending interaction is accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
    pub instance_id: InstanceId,
    pub widget_id: WidgetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
    pub option_value: String,
    pub option_text: String,
    pub widget_type: WidgetKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WidgetInput {
    Choice(String),
    Text(String),
    Number(f64),
    Toggle(bool),
}

impl WidgetInput {
    /// Interprets free-form text (a console line, a form field) for the given kind.
    pub fn parse_for(kind: WidgetKind, raw: &str) -> Self {
        let trimmed = raw.trim();
        match kind {
            WidgetKind::Buttons | WidgetKind::QuickReplies | WidgetKind::Select => {
                WidgetInput::Choice(trimmed.to_string())
            }
            WidgetKind::Input => WidgetInput::Text(raw.to_string()),
            WidgetKind::Slider | WidgetKind::Rating => trimmed
                .parse::<f64>()
                .map(WidgetInput::Number)
                .unwrap_or_else(|_| WidgetInput::Text(raw.to_string())),
            WidgetKind::Toggle => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => WidgetInput::Toggle(true),
                "false" | "no" | "off" | "0" => WidgetInput::Toggle(false),
                _ => WidgetInput::Text(raw.to_string()),
            },
        }
    }
}

impl From<&str> for WidgetInput {
    fn from(value: &str) -> Self {
        WidgetInput::Text(value.to_string())
    }
}

impl From<String> for WidgetInput {
    fn from(value: String) -> Self {
        WidgetInput::Text(value)
    }
}

impl From<f64> for WidgetInput {
    fn from(value: f64) -> Self {
        WidgetInput::Number(value)
    }
}

impl From<bool> for WidgetInput {
    fn from(value: bool) -> Self {
        WidgetInput::Toggle(value)
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum RejectReason {
    #[error("input is empty")]
    Empty,
    #[error("`{0}` is not one of the offered options")]
    UnknownOption(String),
    #[error("input does not match the expected format")]
    PatternMismatch,
    #[error("input is longer than {max} characters")]
    TooLong { max: usize },
    #[error("{value} is outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("rating must be a whole number")]
    NotWhole,
    #[error("{kind} widget cannot take this kind of input")]
    WrongInput { kind: WidgetKind },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    /// The widget is now disabled; the event must be dispatched by the caller.
    Accepted(InteractionEvent),
    /// Nothing changed; the widget is still pending.
    Rejected(RejectReason),
    /// The widget already handled its interaction.
    Ignored,
}

/// Enforces one accepted interaction per rendered widget.
#[derive(Debug)]
pub struct WidgetInteractionEngine {
    id: WidgetId,
    instance_id: InstanceId,
    payload: WidgetPayload,
    pattern: Option<Regex>,
    state: WidgetInteractionState,
    event: Option<InteractionEvent>,
}

impl WidgetInteractionEngine {
    pub fn new(
        id: WidgetId,
        instance_id: InstanceId,
        payload: WidgetPayload,
    ) -> Result<Self, PayloadError> {
        payload.validate()?;
        let pattern = match &payload {
            WidgetPayload::Input(input) => input
                .pattern
                .as_deref()
                .map(compile_pattern)
                .transpose()?,
            _ => None,
        };
        Ok(Self {
            id,
            instance_id,
            payload,
            pattern,
            state: WidgetInteractionState::Pending,
            event: None,
        })
    }

    pub fn id(&self) -> &WidgetId {
        &self.id
    }

    pub fn payload(&self) -> &WidgetPayload {
        &self.payload
    }

    pub fn kind(&self) -> WidgetKind {
        self.payload.kind()
    }

    pub fn state(&self) -> WidgetInteractionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == WidgetInteractionState::Pending
    }

    /// The event raised by the accepted submission, if any.
    pub fn event(&self) -> Option<&InteractionEvent> {
        self.event.as_ref()
    }

    pub fn submit(&mut self, input: impl Into<WidgetInput>) -> SubmitOutcome {
        if self.state != WidgetInteractionState::Pending {
            debug!(widget_id = %self.id, state = ?self.state, "ignoring submit on settled widget");
            return SubmitOutcome::Ignored;
        }

        let (option_id, option_value, option_text) = match self.resolve(input.into()) {
            Ok(resolved) => resolved,
            Err(reason) => {
                debug!(widget_id = %self.id, %reason, "widget input rejected");
                return SubmitOutcome::Rejected(reason);
            }
        };

        self.state = WidgetInteractionState::Submitted;
        let event = InteractionEvent {
            instance_id: self.instance_id.clone(),
            widget_id: self.id.clone(),
            option_id: Some(option_id),
            option_value,
            option_text,
            widget_type: self.kind(),
        };
        self.event = Some(event.clone());
        self.state = WidgetInteractionState::Disabled;
        SubmitOutcome::Accepted(event)
    }

    fn resolve(&self, input: WidgetInput) -> Result<(String, String, String), RejectReason> {
        let kind = self.kind();
        match (&self.payload, input) {
            (
                WidgetPayload::Buttons(choice)
                | WidgetPayload::QuickReplies(choice)
                | WidgetPayload::Select(choice),
                WidgetInput::Choice(raw) | WidgetInput::Text(raw),
            ) => {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(RejectReason::Empty);
                }
                let option = choice
                    .options
                    .iter()
                    .find(|option| option.value == raw)
                    .or_else(|| {
                        choice
                            .options
                            .iter()
                            .find(|option| option.id.as_deref() == Some(raw))
                    })
                    .ok_or_else(|| RejectReason::UnknownOption(raw.to_string()))?;
                Ok((
                    option.option_id().to_string(),
                    option.value.clone(),
                    option.text.clone(),
                ))
            }
            (WidgetPayload::Input(config), WidgetInput::Text(raw) | WidgetInput::Choice(raw)) => {
                let text = raw.trim();
                if text.is_empty() {
                    return Err(RejectReason::Empty);
                }
                if let Some(max) = config.max_length
                    && text.chars().count() > max
                {
                    return Err(RejectReason::TooLong { max });
                }
                if let Some(pattern) = &self.pattern
                    && !pattern.is_match(text)
                {
                    return Err(RejectReason::PatternMismatch);
                }
                Ok(("input-submit".into(), text.to_string(), text.to_string()))
            }
            (WidgetPayload::Slider(slider), WidgetInput::Number(value)) => {
                if !value.is_finite() || value < slider.min || value > slider.max {
                    return Err(RejectReason::OutOfRange {
                        value,
                        min: slider.min,
                        max: slider.max,
                    });
                }
                let value_text = format_number(value);
                let text = match &slider.unit {
                    Some(unit) => format!("{value_text} {unit}"),
                    None => value_text.clone(),
                };
                Ok(("slider-submit".into(), value_text, text))
            }
            (WidgetPayload::Rating(rating), WidgetInput::Number(value)) => {
                let max = f64::from(rating.max);
                if !value.is_finite() || value < 1.0 || value > max {
                    return Err(RejectReason::OutOfRange {
                        value,
                        min: 1.0,
                        max,
                    });
                }
                if value.fract() != 0.0 {
                    return Err(RejectReason::NotWhole);
                }
                let stars = value as u8;
                Ok((
                    "rating-submit".into(),
                    stars.to_string(),
                    format!("{stars}/{}", rating.max),
                ))
            }
            (WidgetPayload::Toggle(toggle), WidgetInput::Toggle(on)) => {
                let text = if on {
                    toggle.on_label.clone()
                } else {
                    toggle.off_label.clone()
                };
                Ok(("toggle-submit".into(), on.to_string(), text))
            }
            (_, WidgetInput::Text(raw) | WidgetInput::Choice(raw)) if raw.trim().is_empty() => {
                Err(RejectReason::Empty)
            }
            _ => Err(RejectReason::WrongInput { kind }),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
