use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::CapturedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[serde(alias = "text")]
    String,
    #[serde(alias = "integer", alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
}

/// Declared input or output of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub observed_values: Vec<serde_json::Value>,
}

impl ParameterDef {
    /// Record a concrete value seen in an execution. Values are only ever
    /// appended; a value already present is not added twice.
    pub fn observe(&mut self, value: serde_json::Value) {
        if value.is_null() || self.observed_values.contains(&value) {
            return;
        }
        self.observed_values.push(value);
    }
}

/// Generalized, reusable description of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStep {
    pub step_number: u32,
    pub screen_pattern: String,
    pub action_template: String,
    #[serde(default)]
    pub uses_inputs: Vec<String>,
    #[serde(default)]
    pub extracts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub inputs: BTreeMap<String, ParameterDef>,
    pub outputs: BTreeMap<String, ParameterDef>,
    pub steps: Vec<TemplateStep>,
    pub created_at: DateTime<Utc>,
}

/// Concrete record of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    pub action: String,
    pub screen_label: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

/// One concrete, parameter-bound execution of a template. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub template_id: Uuid,
    pub session_id: String,
    pub goal: String,
    pub succeeded: bool,
    pub parameter_values: BTreeMap<String, serde_json::Value>,
    pub extracted_values: BTreeMap<String, serde_json::Value>,
    pub step_snapshots: Vec<StepSnapshot>,
    pub created_at: DateTime<Utc>,
}

/// A sub-sequence of events representing one attempt at a task.
///
/// Exists only between segmentation and synthesis; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedInstance {
    pub goal: String,
    pub start_event_index: usize,
    /// Inclusive.
    pub end_event_index: usize,
    pub succeeded: bool,
    pub events: Vec<CapturedEvent>,
}

impl DetectedInstance {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_observe_appends_without_duplicates() {
        let mut def = ParameterDef {
            param_type: ParameterType::String,
            description: "Patient name".to_string(),
            required: true,
            default: None,
            observed_values: vec![json!("Ada")],
        };
        def.observe(json!("Grace"));
        def.observe(json!("Ada"));
        def.observe(serde_json::Value::Null);
        assert_eq!(def.observed_values, vec![json!("Ada"), json!("Grace")]);
    }

    #[test]
    fn test_parameter_type_aliases() {
        let t: ParameterType = serde_json::from_value(json!("integer")).unwrap();
        assert_eq!(t, ParameterType::Number);
        let t: ParameterType = serde_json::from_value(json!("text")).unwrap();
        assert_eq!(t, ParameterType::String);
        assert!(serde_json::from_value::<ParameterType>(json!("date")).is_err());
    }
}
