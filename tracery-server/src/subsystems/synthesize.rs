//! Template synthesis: one detected instance → (template, instance) pair
//!
//! The collaborator generalizes the concrete steps into a reusable template
//! with named parameters and `{placeholder}` actions, and reports the values
//! observed in this execution. Step snapshots always come from the raw events,
//! one per event, whatever number of template steps the collaborator declares.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracery_core::models::{
    screen_label, CanonicalScreen, CapturedEvent, DetectedInstance, ParameterDef, ParameterType,
    StepSnapshot, TemplateStep, WorkflowInstance, WorkflowTemplate,
};
use tracery_core::{ask, Collaborator, CollaboratorError};
use uuid::Uuid;

const SYNTHESIZE_SYSTEM: &str = r#"You turn one recorded execution of a browser workflow into a reusable template.
You receive {goal, events: [{stepNumber, screenType, eventType, clickedText?, typedText?, inputFieldName?, inputFieldType?, url}]}.
Rules:
- Input parameters must come from values the user typed or selected (typedText). Name them in snake_case.
- Template name and description must be generic: no names, ids or values from this execution.
- Every step needs a concrete action such as "Click the Save button" or "Type {patient_name} into the Name field"; never "Perform action".
- Reference inputs in actions as {input_name}; list them in usesInputs. List outputs a step reveals in extracts.
Reply with JSON only:
{"template": {"name": "...", "description": "...",
  "inputs": {"patient_name": {"type": "string", "description": "...", "required": true}},
  "outputs": {"record_id": {"type": "string", "description": "...", "required": false}},
  "steps": [{"screenPattern": "Patient Form", "actionTemplate": "Type {patient_name} into Name", "usesInputs": ["patient_name"], "extracts": []}]},
 "instanceValues": {"inputs": {"patient_name": "Ada Lovelace"}, "outputs": {"record_id": "P-1042"}}}"#;

// ============================================================================
// PUBLIC API
// ============================================================================

/// A template together with the execution it was synthesized from. Always
/// persisted as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedWorkflow {
    pub template: WorkflowTemplate,
    pub instance: WorkflowInstance,
}

/// Synthesize a template and its concrete instance. Never fails: a
/// collaborator error yields a degenerate, parameterless template.
pub async fn synthesize(
    instance: &DetectedInstance,
    screens: &[CanonicalScreen],
    session_id: &str,
    collaborator: &dyn Collaborator,
) -> SynthesizedWorkflow {
    let request = SynthesisRequest {
        goal: &instance.goal,
        events: instance
            .events
            .iter()
            .enumerate()
            .map(|(i, event)| StepSummary::from_event(i, event, screens))
            .collect(),
    };

    let drafted = ask::<_, SynthesisResponse>(collaborator, SYNTHESIZE_SYSTEM, &request)
        .await
        .and_then(validate);

    let (template, parameter_values, extracted_values) = match drafted {
        Ok(response) => {
            let (template, inputs, outputs) = build_template(response);
            tracing::info!(
                goal = %instance.goal,
                template = %template.name,
                inputs = template.inputs.len(),
                outputs = template.outputs.len(),
                steps = template.steps.len(),
                "Synthesized template"
            );
            (template, inputs, outputs)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                goal = %instance.goal,
                "Template synthesis failed, storing raw steps without parameters"
            );
            (fallback_template(instance, screens), BTreeMap::new(), BTreeMap::new())
        }
    };

    let workflow_instance = WorkflowInstance {
        id: Uuid::new_v4(),
        template_id: template.id,
        session_id: session_id.to_string(),
        goal: instance.goal.clone(),
        succeeded: instance.succeeded,
        parameter_values,
        extracted_values,
        step_snapshots: snapshots(&instance.events, screens),
        created_at: Utc::now(),
    };

    SynthesizedWorkflow {
        template,
        instance: workflow_instance,
    }
}

/// One snapshot per raw event, numbered from 1.
pub fn snapshots(events: &[CapturedEvent], screens: &[CanonicalScreen]) -> Vec<StepSnapshot> {
    events
        .iter()
        .enumerate()
        .map(|(i, event)| StepSnapshot {
            step_number: i as u32 + 1,
            screenshot_path: event.screenshot_path.clone(),
            action: event.describe_action(),
            screen_label: screen_label(screens, event.screen_id),
            url: event.url.clone(),
            timestamp: event.timestamp,
        })
        .collect()
}

// ============================================================================
// Collaborator request / response
// ============================================================================

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    goal: &'a str,
    events: Vec<StepSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepSummary {
    step_number: usize,
    screen_type: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    clicked_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    typed_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_field_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_field_type: Option<String>,
    url: String,
}

impl StepSummary {
    fn from_event(index: usize, event: &CapturedEvent, screens: &[CanonicalScreen]) -> Self {
        Self {
            step_number: index + 1,
            screen_type: screen_label(screens, event.screen_id),
            event_type: event.event_type.as_str(),
            clicked_text: event.clicked_text().map(str::to_string),
            typed_text: event.typed_value().map(str::to_string),
            input_field_name: event.field_name().map(str::to_string),
            input_field_type: event.field_type().map(str::to_string),
            url: event.url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisResponse {
    template: TemplateDraft,
    #[serde(default)]
    instance_values: InstanceValues,
}

#[derive(Debug, Deserialize)]
struct TemplateDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    inputs: BTreeMap<String, ParameterDraft>,
    #[serde(default)]
    outputs: BTreeMap<String, ParameterDraft>,
    steps: Vec<StepDraft>,
}

#[derive(Debug, Deserialize)]
struct ParameterDraft {
    #[serde(rename = "type", default = "default_param_type")]
    param_type: ParameterType,
    #[serde(default)]
    description: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<serde_json::Value>,
}

fn default_param_type() -> ParameterType {
    ParameterType::String
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepDraft {
    #[serde(default, alias = "screenType")]
    screen_pattern: String,
    #[serde(alias = "action")]
    action_template: String,
    #[serde(default)]
    uses_inputs: Vec<String>,
    #[serde(default)]
    extracts: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceValues {
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    outputs: BTreeMap<String, serde_json::Value>,
}

fn validate(response: SynthesisResponse) -> Result<SynthesisResponse, CollaboratorError> {
    if response.template.name.trim().is_empty() {
        return Err(CollaboratorError::Schema("template without name".to_string()));
    }
    if response.template.steps.is_empty() {
        return Err(CollaboratorError::Schema("template without steps".to_string()));
    }
    if let Some(n) = response
        .template
        .steps
        .iter()
        .position(|s| s.action_template.trim().is_empty())
    {
        return Err(CollaboratorError::Schema(format!(
            "step {} has no action",
            n + 1
        )));
    }
    Ok(response)
}

// ============================================================================
// Template assembly
// ============================================================================

type Values = BTreeMap<String, serde_json::Value>;

fn build_template(response: SynthesisResponse) -> (WorkflowTemplate, Values, Values) {
    let SynthesisResponse {
        template: draft,
        instance_values,
    } = response;

    let (inputs, parameter_values) = build_parameters(draft.inputs, instance_values.inputs);
    let (outputs, extracted_values) = build_parameters(draft.outputs, instance_values.outputs);

    let input_names: HashSet<&str> = inputs.keys().map(String::as_str).collect();
    let output_names: HashSet<&str> = outputs.keys().map(String::as_str).collect();

    let steps = draft
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| {
            let step_number = i as u32 + 1;
            TemplateStep {
                step_number,
                screen_pattern: step.screen_pattern.trim().to_string(),
                action_template: step.action_template.trim().to_string(),
                uses_inputs: declared_only(step.uses_inputs, &input_names, step_number, "input"),
                extracts: declared_only(step.extracts, &output_names, step_number, "output"),
            }
        })
        .collect();

    let template = WorkflowTemplate {
        id: Uuid::new_v4(),
        name: draft.name.trim().to_string(),
        description: draft.description.trim().to_string(),
        inputs,
        outputs,
        steps,
        created_at: Utc::now(),
    };

    (template, parameter_values, extracted_values)
}

/// Turn declared parameters into `ParameterDef`s seeded with the value
/// reported for this execution. Values for undeclared names are dropped.
fn build_parameters(
    declared: BTreeMap<String, ParameterDraft>,
    mut reported: Values,
) -> (BTreeMap<String, ParameterDef>, Values) {
    let mut defs = BTreeMap::new();
    let mut values = BTreeMap::new();

    for (name, draft) in declared {
        let mut def = ParameterDef {
            param_type: draft.param_type,
            description: draft.description,
            required: draft.required,
            default: draft.default,
            observed_values: Vec::new(),
        };
        if let Some(value) = reported.remove(&name) {
            def.observe(value.clone());
            values.insert(name.clone(), value);
        }
        defs.insert(name, def);
    }

    if !reported.is_empty() {
        tracing::debug!(
            names = ?reported.keys().collect::<Vec<_>>(),
            "Dropping values reported for undeclared parameters"
        );
    }

    (defs, values)
}

/// Keep only references to declared parameters.
fn declared_only(
    names: Vec<String>,
    declared: &HashSet<&str>,
    step_number: u32,
    kind: &str,
) -> Vec<String> {
    let mut kept = Vec::with_capacity(names.len());
    for name in names {
        if declared.contains(name.as_str()) {
            if !kept.contains(&name) {
                kept.push(name);
            }
        } else {
            tracing::warn!(
                step = step_number,
                name = %name,
                kind,
                "Step references an undeclared parameter, dropping the reference"
            );
        }
    }
    kept
}

fn fallback_template(instance: &DetectedInstance, screens: &[CanonicalScreen]) -> WorkflowTemplate {
    let steps = instance
        .events
        .iter()
        .enumerate()
        .map(|(i, event)| TemplateStep {
            step_number: i as u32 + 1,
            screen_pattern: screen_label(screens, event.screen_id),
            action_template: event.describe_action(),
            uses_inputs: Vec::new(),
            extracts: Vec::new(),
        })
        .collect();

    WorkflowTemplate {
        id: Uuid::new_v4(),
        name: instance.goal.clone(),
        description: format!("Recorded steps for: {}", instance.goal),
        inputs: BTreeMap::new(),
        outputs: BTreeMap::new(),
        steps,
        created_at: Utc::now(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::testing::{click, typed, ScriptedCollaborator};
    use serde_json::json;

    fn patient_instance() -> (Vec<CanonicalScreen>, DetectedInstance) {
        let list = CanonicalScreen::new("Patient List", "All patients");
        let form = CanonicalScreen::new("Patient Form", "Create a patient");

        let mut events = vec![
            click("https://clinic.test/patients", "New patient"),
            typed("https://clinic.test/patients/new", "name", "Ada Lovelace"),
            typed("https://clinic.test/patients/new", "dob", "1815-12-10"),
            click("https://clinic.test/patients/new", "Save"),
        ];
        events[0].screen_id = Some(list.id);
        events[0].screenshot_path = Some("shots/0.png".to_string());
        for event in events.iter_mut().skip(1) {
            event.screen_id = Some(form.id);
        }

        let instance = DetectedInstance {
            goal: "Register a new patient".to_string(),
            start_event_index: 1,
            end_event_index: 4,
            succeeded: true,
            events,
        };
        (vec![list, form], instance)
    }

    fn template_reply() -> serde_json::Value {
        json!({
            "template": {
                "name": "Register patient",
                "description": "Create a patient record from the list page",
                "inputs": {
                    "patient_name": { "type": "string", "description": "Full name", "required": true },
                    "birth_date": { "type": "string", "description": "Date of birth", "required": false }
                },
                "outputs": {
                    "patient_id": { "type": "text", "description": "New record id" }
                },
                "steps": [
                    { "screenPattern": "Patient List", "actionTemplate": "Click New patient" },
                    { "screenPattern": "Patient Form", "actionTemplate": "Type {patient_name} into Name", "usesInputs": ["patient_name"] },
                    { "screenPattern": "Patient Form", "actionTemplate": "Type {birth_date} into DOB and save", "usesInputs": ["birth_date", "insurer"], "extracts": ["patient_id"] }
                ]
            },
            "instanceValues": {
                "inputs": { "patient_name": "Ada Lovelace", "birth_date": "1815-12-10", "stray": "x" },
                "outputs": { "patient_id": "P-1042" }
            }
        })
    }

    #[tokio::test]
    async fn test_synthesizes_parameterized_template() {
        let (screens, instance) = patient_instance();
        let collaborator = ScriptedCollaborator::replying(template_reply());

        let result = synthesize(&instance, &screens, "session-7", &collaborator).await;
        let template = &result.template;

        assert_eq!(collaborator.calls(), 1);
        assert_eq!(template.name, "Register patient");
        assert_eq!(template.inputs.len(), 2);
        assert_eq!(
            template.inputs["patient_name"].observed_values,
            vec![json!("Ada Lovelace")]
        );
        assert_eq!(template.outputs["patient_id"].param_type, ParameterType::String);

        let numbers: Vec<u32> = template.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        // Undeclared "insurer" reference is repaired away.
        assert_eq!(template.steps[2].uses_inputs, vec!["birth_date"]);
        assert_eq!(template.steps[2].extracts, vec!["patient_id"]);

        let instance_record = &result.instance;
        assert_eq!(instance_record.template_id, template.id);
        assert_eq!(instance_record.session_id, "session-7");
        assert_eq!(instance_record.parameter_values["birth_date"], json!("1815-12-10"));
        assert!(!instance_record.parameter_values.contains_key("stray"));
        assert_eq!(instance_record.extracted_values["patient_id"], json!("P-1042"));
    }

    #[tokio::test]
    async fn test_snapshots_follow_raw_events_not_template_steps() {
        let (screens, instance) = patient_instance();
        let collaborator = ScriptedCollaborator::replying(template_reply());

        let result = synthesize(&instance, &screens, "s", &collaborator).await;

        assert_eq!(result.template.steps.len(), 3);
        let snapshots = &result.instance.step_snapshots;
        assert_eq!(snapshots.len(), 4);
        assert_eq!(snapshots[0].screenshot_path.as_deref(), Some("shots/0.png"));
        assert_eq!(snapshots[0].screen_label, "Patient List");
        assert_eq!(snapshots[1].action, "type \"Ada Lovelace\" into name");
        assert_eq!(snapshots[3].step_number, 4);
    }

    #[tokio::test]
    async fn test_request_shape() {
        let (screens, instance) = patient_instance();
        let collaborator = ScriptedCollaborator::replying(template_reply());

        synthesize(&instance, &screens, "s", &collaborator).await;

        let request = &collaborator.requests()[0];
        assert_eq!(request["goal"], "Register a new patient");
        let events = request["events"].as_array().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["stepNumber"], 1);
        assert_eq!(events[0]["clickedText"], "New patient");
        assert_eq!(events[1]["typedText"], "Ada Lovelace");
        assert_eq!(events[1]["inputFieldName"], "name");
        assert_eq!(events[1]["screenType"], "Patient Form");
        assert!(events[0].get("typedText").is_none());
    }

    #[tokio::test]
    async fn test_fallback_on_collaborator_error() {
        let (screens, instance) = patient_instance();
        let collaborator = ScriptedCollaborator::failing();

        let result = synthesize(&instance, &screens, "s", &collaborator).await;

        assert_eq!(result.template.name, "Register a new patient");
        assert!(result.template.inputs.is_empty());
        assert!(result.template.outputs.is_empty());
        assert_eq!(result.template.steps.len(), 4);
        assert_eq!(result.template.steps[3].action_template, "click \"Save\"");
        assert!(result.instance.parameter_values.is_empty());
        assert!(result.instance.extracted_values.is_empty());
        assert_eq!(result.instance.template_id, result.template.id);
    }

    #[tokio::test]
    async fn test_schema_violations_fall_back() {
        let (screens, instance) = patient_instance();
        for reply in [
            json!({ "template": { "name": "", "steps": [{ "actionTemplate": "Click" }] } }),
            json!({ "template": { "name": "X", "steps": [] } }),
            json!({ "template": { "name": "X", "steps": [{ "actionTemplate": "  " }] } }),
            json!({ "template": { "name": "X", "inputs": { "a": { "type": "date" } }, "steps": [{ "actionTemplate": "Go" }] } }),
        ] {
            let collaborator = ScriptedCollaborator::replying(reply);
            let result = synthesize(&instance, &screens, "s", &collaborator).await;
            assert_eq!(result.template.name, "Register a new patient");
            assert_eq!(result.template.steps.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_missing_instance_values_leave_observed_empty() {
        let (screens, instance) = patient_instance();
        let collaborator = ScriptedCollaborator::replying(json!({
            "template": {
                "name": "Register patient",
                "inputs": { "patient_name": { "type": "string", "required": true } },
                "steps": [{ "screenType": "Patient Form", "action": "Type {patient_name}", "usesInputs": ["patient_name"] }]
            }
        }));

        let result = synthesize(&instance, &screens, "s", &collaborator).await;
        assert!(result.template.inputs["patient_name"].observed_values.is_empty());
        assert!(result.instance.parameter_values.is_empty());
        assert_eq!(result.template.steps[0].screen_pattern, "Patient Form");
        assert_eq!(result.template.steps[0].action_template, "Type {patient_name}");
    }
}
