//! SQLite persistence for screens, captured events and workflows.
//!
//! Structured columns (patterns, parameters, steps, snapshots) are JSON text.
//! Screens and templates are upserted by id; instances are append-only.
//!
//! Writers take a connection rather than the pool so a caller can run several
//! of them inside one outer transaction. Each writer opens its own nested
//! transaction (a savepoint when one is already open).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tracery_core::models::{CanonicalScreen, CapturedEvent, WorkflowInstance, WorkflowTemplate};
use tracery_core::TraceryError;
use uuid::Uuid;

use crate::subsystems::synthesize::SynthesizedWorkflow;

pub async fn upsert_screens(
    conn: &mut SqliteConnection,
    screens: &[CanonicalScreen],
) -> Result<(), TraceryError> {
    let mut tx = conn.begin().await?;
    for screen in screens {
        sqlx::query(
            r#"
            INSERT INTO canonical_screens (id, label, description, url_patterns, example_screenshot_path)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                label = excluded.label,
                description = excluded.description,
                url_patterns = excluded.url_patterns,
                example_screenshot_path = excluded.example_screenshot_path
            "#,
        )
        .bind(screen.id.to_string())
        .bind(&screen.label)
        .bind(&screen.description)
        .bind(serde_json::to_string(&screen.url_patterns)?)
        .bind(&screen.example_screenshot_path)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Store a session's events in order, each with its resolved screen.
/// Re-finalizing a session overwrites rows by (session, index).
pub async fn insert_events(
    conn: &mut SqliteConnection,
    session_id: &str,
    events: &[CapturedEvent],
) -> Result<(), TraceryError> {
    let mut tx = conn.begin().await?;
    for (index, event) in events.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO captured_events (session_id, event_index, screen_id, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(session_id)
        .bind(index as i64)
        .bind(event.screen_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(event)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Write a template and its instance atomically: both rows or neither.
pub async fn persist_workflow(
    conn: &mut SqliteConnection,
    workflow: &SynthesizedWorkflow,
) -> Result<(), TraceryError> {
    let template = &workflow.template;
    let instance = &workflow.instance;

    // Encode up front; the transaction only runs the two inserts.
    let inputs = serde_json::to_string(&template.inputs)?;
    let outputs = serde_json::to_string(&template.outputs)?;
    let steps = serde_json::to_string(&template.steps)?;
    let parameter_values = serde_json::to_string(&instance.parameter_values)?;
    let extracted_values = serde_json::to_string(&instance.extracted_values)?;
    let snapshots = serde_json::to_string(&instance.step_snapshots)?;

    let mut tx = conn.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workflow_templates (id, name, description, inputs, outputs, steps, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            inputs = excluded.inputs,
            outputs = excluded.outputs,
            steps = excluded.steps
        "#,
    )
    .bind(template.id.to_string())
    .bind(&template.name)
    .bind(&template.description)
    .bind(inputs)
    .bind(outputs)
    .bind(steps)
    .bind(template.created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (id, template_id, session_id, goal, succeeded, parameter_values, extracted_values, step_snapshots, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(instance.id.to_string())
    .bind(instance.template_id.to_string())
    .bind(&instance.session_id)
    .bind(&instance.goal)
    .bind(instance.succeeded)
    .bind(parameter_values)
    .bind(extracted_values)
    .bind(snapshots)
    .bind(instance.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::debug!(
        template_id = %template.id,
        instance_id = %instance.id,
        "Persisted workflow"
    );
    Ok(())
}

// ============================================================================
// Reads
// ============================================================================

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    description: String,
    inputs: String,
    outputs: String,
    steps: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for WorkflowTemplate {
    type Error = TraceryError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(WorkflowTemplate {
            id: parse_id(&row.id)?,
            name: row.name,
            description: row.description,
            inputs: serde_json::from_str(&row.inputs)?,
            outputs: serde_json::from_str(&row.outputs)?,
            steps: serde_json::from_str(&row.steps)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    template_id: String,
    session_id: String,
    goal: String,
    succeeded: bool,
    parameter_values: String,
    extracted_values: String,
    step_snapshots: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
    type Error = TraceryError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(WorkflowInstance {
            id: parse_id(&row.id)?,
            template_id: parse_id(&row.template_id)?,
            session_id: row.session_id,
            goal: row.goal,
            succeeded: row.succeeded,
            parameter_values: serde_json::from_str::<BTreeMap<_, _>>(&row.parameter_values)?,
            extracted_values: serde_json::from_str::<BTreeMap<_, _>>(&row.extracted_values)?,
            step_snapshots: serde_json::from_str(&row.step_snapshots)?,
            created_at: row.created_at,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, TraceryError> {
    Uuid::parse_str(raw).map_err(|e| TraceryError::Other(format!("bad id {raw:?}: {e}")))
}

/// All templates, newest first.
pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<WorkflowTemplate>, TraceryError> {
    let rows: Vec<TemplateRow> = sqlx::query_as(
        "SELECT id, name, description, inputs, outputs, steps, created_at
         FROM workflow_templates ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(WorkflowTemplate::try_from).collect()
}

pub async fn get_template(pool: &SqlitePool, id: Uuid) -> Result<Option<WorkflowTemplate>, TraceryError> {
    let row: Option<TemplateRow> = sqlx::query_as(
        "SELECT id, name, description, inputs, outputs, steps, created_at
         FROM workflow_templates WHERE id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(WorkflowTemplate::try_from).transpose()
}

/// Executions of one template in the order they were recorded.
pub async fn list_instances(pool: &SqlitePool, template_id: Uuid) -> Result<Vec<WorkflowInstance>, TraceryError> {
    let rows: Vec<InstanceRow> = sqlx::query_as(
        "SELECT id, template_id, session_id, goal, succeeded, parameter_values,
                extracted_values, step_snapshots, created_at
         FROM workflow_instances WHERE template_id = ?1 ORDER BY created_at ASC",
    )
    .bind(template_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(WorkflowInstance::try_from).collect()
}

pub async fn count_screens(pool: &SqlitePool) -> Result<i64, TraceryError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM canonical_screens")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

pub async fn count_events(pool: &SqlitePool, session_id: &str) -> Result<i64, TraceryError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM captured_events WHERE session_id = ?1")
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
