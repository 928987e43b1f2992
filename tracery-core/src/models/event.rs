use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of UI interaction captured by the browser recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Click,
    Input,
    Change,
    Submit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Click => "click",
            EventType::Input => "input",
            EventType::Change => "change",
            EventType::Submit => "submit",
        }
    }
}

/// Element the user interacted with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Form field metadata for input/change events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// One raw UI interaction as delivered by the capture side.
///
/// `screen_id` starts unset and is assigned exactly once, during
/// canonicalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EventTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_id: Option<Uuid>,
}

impl CapturedEvent {
    pub fn new(event_type: EventType, url: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            url: url.into(),
            screenshot_path: None,
            target: None,
            input: None,
            screen_id: None,
        }
    }

    /// Assign the canonical screen. Returns `false` (and leaves the event
    /// untouched) if a screen was already assigned.
    pub fn assign_screen(&mut self, screen_id: Uuid) -> bool {
        if self.screen_id.is_some() {
            return false;
        }
        self.screen_id = Some(screen_id);
        true
    }

    pub fn clicked_text(&self) -> Option<&str> {
        self.target
            .as_ref()
            .and_then(|t| t.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn typed_value(&self) -> Option<&str> {
        self.input.as_ref().and_then(|i| i.value.as_deref())
    }

    pub fn field_name(&self) -> Option<&str> {
        self.input.as_ref().and_then(|i| i.name.as_deref())
    }

    pub fn field_type(&self) -> Option<&str> {
        self.input.as_ref().and_then(|i| i.field_type.as_deref())
    }

    /// Literal, human-readable description of what happened.
    pub fn describe_action(&self) -> String {
        let element = self
            .clicked_text()
            .or_else(|| self.target.as_ref().and_then(|t| t.selector.as_deref()))
            .or_else(|| self.target.as_ref().and_then(|t| t.tag.as_deref()));

        match self.event_type {
            EventType::Click => match element {
                Some(e) => format!("click \"{}\"", e),
                None => "click".to_string(),
            },
            EventType::Input | EventType::Change => {
                let verb = if self.event_type == EventType::Input {
                    "type"
                } else {
                    "select"
                };
                let field = self.field_name().or(element);
                match (self.typed_value(), field) {
                    (Some(v), Some(f)) => format!("{} \"{}\" into {}", verb, v, f),
                    (Some(v), None) => format!("{} \"{}\"", verb, v),
                    (None, Some(f)) => format!("{} into {}", verb, f),
                    (None, None) => verb.to_string(),
                }
            }
            EventType::Submit => match element {
                Some(e) => format!("submit \"{}\"", e),
                None => "submit form".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_assigned_once() {
        let mut event = CapturedEvent::new(EventType::Click, "https://app.test/home");
        let first = Uuid::new_v4();
        assert!(event.assign_screen(first));
        assert!(!event.assign_screen(Uuid::new_v4()));
        assert_eq!(event.screen_id, Some(first));
    }

    #[test]
    fn test_describe_click_and_input() {
        let mut click = CapturedEvent::new(EventType::Click, "https://app.test/");
        click.target = Some(EventTarget {
            text: Some("  Save patient ".to_string()),
            ..Default::default()
        });
        assert_eq!(click.describe_action(), "click \"Save patient\"");

        let mut input = CapturedEvent::new(EventType::Input, "https://app.test/");
        input.input = Some(InputMeta {
            name: Some("email".to_string()),
            field_type: Some("email".to_string()),
            value: Some("alice@example.com".to_string()),
        });
        assert_eq!(
            input.describe_action(),
            "type \"alice@example.com\" into email"
        );
    }

    #[test]
    fn test_deserialize_capture_payload() {
        let raw = serde_json::json!({
            "timestamp": 1_700_000_000_000i64,
            "eventType": "change",
            "url": "https://app.test/settings",
            "screenshotPath": "shots/1.png",
            "input": { "name": "theme", "fieldType": "select", "value": "dark" }
        });
        let event: CapturedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, EventType::Change);
        assert_eq!(event.typed_value(), Some("dark"));
        assert!(event.screen_id.is_none());
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
    }
}
