//! Interactive widgets attached to bot messages.
//!
//! [`WidgetPayload`] is the closed set of widget kinds the backend may attach to a
//! reply. Payloads are validated when they are parsed; anything with an unknown
//! `type` or an unusable configuration never reaches a
//! [`WidgetInteractionEngine`].

mod engine;

use std::collections::HashSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PayloadError;

pub use engine::{
    InteractionEvent, RejectReason, SubmitOutcome, WidgetId, WidgetInput,
    WidgetInteractionEngine, WidgetInteractionState,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Buttons,
    QuickReplies,
    Select,
    Input,
    Slider,
    Toggle,
    Rating,
}

impl WidgetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetKind::Buttons => "buttons",
            WidgetKind::QuickReplies => "quick_replies",
            WidgetKind::Select => "select",
            WidgetKind::Input => "input",
            WidgetKind::Slider => "slider",
            WidgetKind::Toggle => "toggle",
            WidgetKind::Rating => "rating",
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetPayload {
    Buttons(ChoiceConfig),
    #[serde(alias = "quickReplies")]
    QuickReplies(ChoiceConfig),
    #[serde(alias = "dropdown")]
    Select(ChoiceConfig),
    Input(InputConfig),
    #[serde(alias = "range")]
    Slider(SliderConfig),
    Toggle(ToggleConfig),
    Rating(RatingConfig),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub options: Vec<WidgetOption>,
}

/// One selectable entry. Backends may send a bare string, which becomes both the
/// text and the value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawOption")]
pub struct WidgetOption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub value: String,
}

impl WidgetOption {
    pub fn new(text: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            value: value.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn option_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.value)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOption {
    Text(String),
    Full {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "label")]
        text: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

impl From<RawOption> for WidgetOption {
    fn from(raw: RawOption) -> Self {
        match raw {
            RawOption::Text(text) => WidgetOption::new(text.clone(), text),
            RawOption::Full { id, text, value } => {
                let value = match value {
                    Some(Value::String(value)) => value,
                    Some(Value::Null) | None => text.clone(),
                    Some(other) => other.to_string(),
                };
                WidgetOption { id, text, value }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    /// Regular expression the trimmed input must match in full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderConfig {
    pub min: f64,
    pub max: f64,
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_on_label")]
    pub on_label: String,
    #[serde(default = "default_off_label")]
    pub off_label: String,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self {
            label: None,
            on_label: default_on_label(),
            off_label: default_off_label(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingConfig {
    #[serde(default = "default_rating_max")]
    pub max: u8,
}

impl WidgetPayload {
    /// Parses and validates a widget object received from the backend.
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        let payload: WidgetPayload = serde_json::from_value(value.clone())
            .map_err(|err| PayloadError::Malformed(err.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> WidgetKind {
        match self {
            WidgetPayload::Buttons(_) => WidgetKind::Buttons,
            WidgetPayload::QuickReplies(_) => WidgetKind::QuickReplies,
            WidgetPayload::Select(_) => WidgetKind::Select,
            WidgetPayload::Input(_) => WidgetKind::Input,
            WidgetPayload::Slider(_) => WidgetKind::Slider,
            WidgetPayload::Toggle(_) => WidgetKind::Toggle,
            WidgetPayload::Rating(_) => WidgetKind::Rating,
        }
    }

    pub fn options(&self) -> &[WidgetOption] {
        match self {
            WidgetPayload::Buttons(choice)
            | WidgetPayload::QuickReplies(choice)
            | WidgetPayload::Select(choice) => &choice.options,
            _ => &[],
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            WidgetPayload::Buttons(choice)
            | WidgetPayload::QuickReplies(choice)
            | WidgetPayload::Select(choice) => {
                if choice.options.is_empty() {
                    return Err(PayloadError::EmptyOptions {
                        kind: self.kind().as_str(),
                    });
                }
                let mut seen = HashSet::new();
                for option in &choice.options {
                    if !seen.insert(option.value.as_str()) {
                        return Err(PayloadError::DuplicateOption(option.value.clone()));
                    }
                }
                Ok(())
            }
            WidgetPayload::Input(input) => {
                if let Some(pattern) = &input.pattern {
                    compile_pattern(pattern)?;
                }
                Ok(())
            }
            WidgetPayload::Slider(slider) => {
                if !(slider.min < slider.max) {
                    return Err(PayloadError::EmptyRange {
                        min: slider.min,
                        max: slider.max,
                    });
                }
                if !(slider.step > 0.0) {
                    return Err(PayloadError::InvalidStep(slider.step));
                }
                if let Some(value) = slider.default
                    && !(slider.min..=slider.max).contains(&value)
                {
                    return Err(PayloadError::DefaultOutOfRange {
                        value,
                        min: slider.min,
                        max: slider.max,
                    });
                }
                Ok(())
            }
            WidgetPayload::Toggle(_) => Ok(()),
            WidgetPayload::Rating(rating) => {
                if rating.max == 0 {
                    return Err(PayloadError::InvalidRatingMax);
                }
                Ok(())
            }
        }
    }
}

/// Anchors the pattern so it has to match the whole input.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, PayloadError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| PayloadError::InvalidPattern(err.to_string()))
}

fn default_step() -> f64 {
    1.0
}

fn default_on_label() -> String {
    "Yes".to_string()
}

fn default_off_label() -> String {
    "No".to_string()
}

fn default_rating_max() -> u8 {
    5
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_every_kind() {
        let cases = vec![
            (json!({"type": "buttons", "options": ["Yes", "No"]}), WidgetKind::Buttons),
            (
                json!({"type": "quickReplies", "options": [{"text": "Later", "value": "later"}]}),
                WidgetKind::QuickReplies,
            ),
            (json!({"type": "dropdown", "options": ["a"]}), WidgetKind::Select),
            (json!({"type": "input", "placeholder": "Email"}), WidgetKind::Input),
            (json!({"type": "slider", "min": 0, "max": 10}), WidgetKind::Slider),
            (json!({"type": "toggle", "label": "Subscribe"}), WidgetKind::Toggle),
            (json!({"type": "rating"}), WidgetKind::Rating),
        ];
        for (raw, kind) in cases {
            let payload = WidgetPayload::from_value(&raw).unwrap();
            assert_eq!(payload.kind(), kind, "payload {raw}");
        }
    }

    #[test]
    fn string_options_become_text_and_value() {
        let payload = WidgetPayload::from_value(&json!({
            "type": "buttons",
            "options": ["Yes", {"id": "n", "label": "No", "value": 0}]
        }))
        .unwrap();
        let options = payload.options();
        assert_eq!(options[0], WidgetOption::new("Yes", "Yes"));
        assert_eq!(options[1].value, "0");
        assert_eq!(options[1].option_id(), "n");
        assert_eq!(options[0].option_id(), "Yes");
    }

    #[test]
    fn rejects_unknown_type() {
        let err = WidgetPayload::from_value(&json!({"type": "carousel", "items": []})).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn rejects_choice_without_options() {
        let err = WidgetPayload::from_value(&json!({"type": "select", "options": []})).unwrap_err();
        assert_eq!(err, PayloadError::EmptyOptions { kind: "select" });
        let err = WidgetPayload::from_value(&json!({"type": "buttons"})).unwrap_err();
        assert_eq!(err, PayloadError::EmptyOptions { kind: "buttons" });
    }

    #[test]
    fn rejects_duplicate_option_values() {
        let err = WidgetPayload::from_value(&json!({"type": "buttons", "options": ["a", "a"]}))
            .unwrap_err();
        assert_eq!(err, PayloadError::DuplicateOption("a".into()));
    }

    #[test]
    fn rejects_broken_slider_and_pattern() {
        assert!(matches!(
            WidgetPayload::from_value(&json!({"type": "slider", "min": 5, "max": 5})),
            Err(PayloadError::EmptyRange { .. })
        ));
        assert!(matches!(
            WidgetPayload::from_value(&json!({"type": "slider", "min": 0, "max": 5, "step": 0})),
            Err(PayloadError::InvalidStep(_))
        ));
        assert!(matches!(
            WidgetPayload::from_value(&json!({"type": "slider", "min": 0, "max": 5, "default": 9})),
            Err(PayloadError::DefaultOutOfRange { .. })
        ));
        assert!(matches!(
            WidgetPayload::from_value(&json!({"type": "input", "pattern": "(["})),
            Err(PayloadError::InvalidPattern(_))
        ));
        assert!(matches!(
            WidgetPayload::from_value(&json!({"type": "rating", "max": 0})),
            Err(PayloadError::InvalidRatingMax)
        ));
    }
}
