//! Normalization of the loosely typed `action` field.
//!
//! The backend reports a persona's action either as free text
//! (`"click Sign up"`) or as an object (`{"type": "click", "selector": ...}`).
//! Both shapes are folded into [`Action`] before anything reaches the store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    Wait,
    Back,
    Hover,
    Select,
    Extract,
    Done,
    Other,
}

impl ActionKind {
    pub fn from_verb(verb: &str) -> Self {
        match verb.trim().to_ascii_lowercase().as_str() {
            "click" | "tap" | "press" => ActionKind::Click,
            "type" | "fill" | "input" | "input_text" => ActionKind::Type,
            "scroll" | "scroll_down" | "scroll_up" => ActionKind::Scroll,
            "navigate" | "goto" | "go_to" | "go_to_url" | "open" | "visit" => ActionKind::Navigate,
            "wait" => ActionKind::Wait,
            "back" | "go_back" => ActionKind::Back,
            "hover" => ActionKind::Hover,
            "select" | "select_option" => ActionKind::Select,
            "extract" | "read" | "extract_content" => ActionKind::Extract,
            "done" | "finish" | "complete" => ActionKind::Done,
            _ => ActionKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Navigate => "navigate",
            ActionKind::Wait => "wait",
            ActionKind::Back => "back",
            ActionKind::Hover => "hover",
            ActionKind::Select => "select",
            ActionKind::Extract => "extract",
            ActionKind::Done => "done",
            ActionKind::Other => "other",
        }
    }
}

/// Normalized persona action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

const KIND_KEYS: &[&str] = &["type", "action", "kind", "name"];
const DETAIL_KEYS: &[&str] = &[
    "description",
    "detail",
    "text",
    "value",
    "url",
    "selector",
    "target",
];

impl Action {
    pub fn new(kind: ActionKind, detail: Option<String>) -> Self {
        Self { kind, detail }
    }

    /// Normalizes a raw wire value. Returns `None` for null, empty text or
    /// shapes that carry no action at all.
    pub fn normalize(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(text) => Self::from_text(text),
            Value::Object(map) => Some(Self::from_object(map)),
            _ => None,
        }
    }

    fn from_text(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let (verb, rest) = match text.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (text, ""),
        };
        let kind = ActionKind::from_verb(verb.trim_end_matches(':'));
        let detail = match kind {
            // keep the verb so nothing the backend said is lost
            ActionKind::Other => Some(text.to_string()),
            _ if rest.is_empty() => None,
            _ => Some(rest.to_string()),
        };
        Some(Self { kind, detail })
    }

    fn from_object(map: &Map<String, Value>) -> Self {
        let verb = KIND_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str));
        let kind = verb.map(ActionKind::from_verb).unwrap_or(ActionKind::Other);
        let detail = DETAIL_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| match (kind, verb) {
                (ActionKind::Other, Some(verb)) => Some(verb.to_string()),
                _ => None,
            });
        Self { kind, detail }
    }

    pub fn label(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{} {}", self.kind.as_str(), detail),
            None => self.kind.as_str().to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Action::normalize(&raw)
            .ok_or_else(|| serde::de::Error::custom("action must be a non-empty string or an object"))
    }
}

/// Lenient field deserializer: anything that does not normalize becomes `None`
/// instead of failing the whole message.
pub(crate) fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Action::normalize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_actions_split_verb_and_detail() {
        let action = Action::normalize(&json!("Click the Sign up button")).unwrap();
        assert_eq!(action.kind, ActionKind::Click);
        assert_eq!(action.detail.as_deref(), Some("the Sign up button"));

        let bare = Action::normalize(&json!("scroll")).unwrap();
        assert_eq!(bare, Action::new(ActionKind::Scroll, None));
    }

    #[test]
    fn unknown_verbs_keep_the_full_text() {
        let action = Action::normalize(&json!("ponder the pricing table")).unwrap();
        assert_eq!(action.kind, ActionKind::Other);
        assert_eq!(action.detail.as_deref(), Some("ponder the pricing table"));
    }

    #[test]
    fn object_actions_use_first_known_keys() {
        let action = Action::normalize(&json!({
            "action": "go_to_url",
            "url": "https://example.com/pricing",
            "selector": "ignored"
        }))
        .unwrap();
        assert_eq!(action.kind, ActionKind::Navigate);
        assert_eq!(action.detail.as_deref(), Some("https://example.com/pricing"));

        let typed = Action::normalize(&json!({"type": "input_text", "text": " hello "})).unwrap();
        assert_eq!(typed, Action::new(ActionKind::Type, Some("hello".into())));
    }

    #[test]
    fn null_and_blank_values_are_not_actions() {
        assert!(Action::normalize(&Value::Null).is_none());
        assert!(Action::normalize(&json!("   ")).is_none());
        assert!(Action::normalize(&json!(42)).is_none());
    }

    #[test]
    fn serialized_form_normalizes_back() {
        let action = Action::new(ActionKind::Hover, Some("menu".into()));
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value, json!({"kind": "hover", "detail": "menu"}));
        let back: Action = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }
}
