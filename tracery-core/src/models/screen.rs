use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A generalized UI state that many concrete URLs map to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalScreen {
    pub id: Uuid,
    pub label: String,
    pub description: String,
    pub url_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_screenshot_path: Option<String>,
}

impl CanonicalScreen {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            description: description.into(),
            url_patterns: Vec::new(),
            example_screenshot_path: None,
        }
    }

    /// Add a URL pattern, keeping `url_patterns` free of duplicates.
    pub fn add_pattern(&mut self, pattern: &str) {
        if !self.url_patterns.iter().any(|p| p == pattern) {
            self.url_patterns.push(pattern.to_string());
        }
    }
}

/// Look up a screen label by id, falling back to "Unknown screen".
pub fn screen_label(screens: &[CanonicalScreen], id: Option<Uuid>) -> String {
    id.and_then(|id| screens.iter().find(|s| s.id == id))
        .map(|s| s.label.clone())
        .unwrap_or_else(|| "Unknown screen".to_string())
}
