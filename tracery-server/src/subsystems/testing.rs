//! Test doubles shared by the subsystem unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracery_core::models::{CanonicalScreen, CapturedEvent, EventTarget, EventType, InputMeta};
use tracery_core::{Collaborator, CollaboratorError};

/// Replies with queued texts in order; `None` (or an empty queue) fails the call.
pub struct ScriptedCollaborator {
    replies: Mutex<VecDeque<Option<String>>>,
    requests: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedCollaborator {
    pub fn new(replies: Vec<Option<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(json: serde_json::Value) -> Self {
        Self::new(vec![Some(json.to_string())])
    }

    pub fn failing() -> Self {
        Self::new(vec![])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User payloads received so far, parsed back into JSON.
    pub fn requests(&self) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| serde_json::from_str(r).unwrap())
            .collect()
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(user.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Some(text)) => Ok(text),
            _ => Err(CollaboratorError::Unavailable),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn click(url: &str, text: &str) -> CapturedEvent {
    let mut event = CapturedEvent::new(EventType::Click, url);
    event.timestamp = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    event.target = Some(EventTarget {
        tag: Some("button".to_string()),
        text: Some(text.to_string()),
        ..Default::default()
    });
    event
}

pub fn typed(url: &str, field: &str, value: &str) -> CapturedEvent {
    let mut event = CapturedEvent::new(EventType::Input, url);
    event.timestamp = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    event.input = Some(InputMeta {
        name: Some(field.to_string()),
        field_type: Some("text".to_string()),
        value: Some(value.to_string()),
    });
    event
}

/// Home is the only base screen; two excursions of two steps each.
pub fn two_excursions() -> Vec<CapturedEvent> {
    vec![
        click("https://app.test/home", "Start"),
        click("https://app.test/home", "New order"),
        typed("https://app.test/orders/new", "sku", "A-1"),
        click("https://app.test/orders/confirm", "Confirm"),
        click("https://app.test/home", "Back"),
        click("https://app.test/home", "New customer"),
        typed("https://app.test/customers/new", "name", "Ada"),
        click("https://app.test/customers/confirm", "Confirm"),
        click("https://app.test/home", "Done"),
    ]
}

/// One canonical screen per label plus one event per entry of `sequence`,
/// each event already resolved to its screen.
pub fn screens_and_events(sequence: &[&str]) -> (Vec<CanonicalScreen>, Vec<CapturedEvent>) {
    let mut screens: Vec<CanonicalScreen> = Vec::new();
    let mut events = Vec::new();
    for label in sequence {
        let id = match screens.iter().find(|s| s.label == *label) {
            Some(s) => s.id,
            None => {
                let mut screen = CanonicalScreen::new(*label, format!("{} screen", label));
                screen.add_pattern(&format!("/{}", label.to_lowercase()));
                let id = screen.id;
                screens.push(screen);
                id
            }
        };
        let mut event = click(&format!("https://app.test/{}", label.to_lowercase()), label);
        event.screen_id = Some(id);
        events.push(event);
    }
    (screens, events)
}

/// Labels of the screens an instance's events resolve to.
pub fn labels(screens: &[CanonicalScreen], events: &[CapturedEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| tracery_core::models::screen_label(screens, e.screen_id))
        .collect()
}
