//! Finalization pipeline: canonicalize → segment → synthesize → persist
//!
//! Collaborator failures never abort a run; each stage falls back on its own.
//! Only persistence errors reach the caller. Stages are never retried.
//!
//! Everything a run stores is written in one transaction after the last
//! collaborator call, so a failed run leaves the database untouched and the
//! session can be finalized again from scratch.

use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tracery_core::config::{PipelineConfig, TraceryConfig};
use tracery_core::models::{CanonicalScreen, CapturedEvent, WorkflowInstance, WorkflowTemplate};
use tracery_core::{Collaborator, TraceryError};

use crate::subsystems::canonicalize::canonicalize;
use crate::subsystems::persist;
use crate::subsystems::segment::{create_segmenter, Segmenter, SegmenterKind};
use crate::subsystems::synthesize::synthesize;

/// Everything one finalize run produced.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOutcome {
    pub screens: Vec<CanonicalScreen>,
    pub templates: Vec<WorkflowTemplate>,
    pub instances: Vec<WorkflowInstance>,
}

impl FinalizeOutcome {
    pub fn is_empty(&self) -> bool {
        self.screens.is_empty() && self.templates.is_empty() && self.instances.is_empty()
    }

    /// Compact view returned over IPC.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "screens": self.screens.iter().map(|s| json!({
                "id": s.id,
                "label": s.label,
                "urlPatterns": s.url_patterns,
            })).collect::<Vec<_>>(),
            "templates": self.templates.iter().map(|t| json!({
                "id": t.id,
                "name": t.name,
                "inputs": t.inputs.keys().collect::<Vec<_>>(),
                "outputs": t.outputs.keys().collect::<Vec<_>>(),
                "steps": t.steps.len(),
            })).collect::<Vec<_>>(),
            "instances": self.instances.iter().map(|i| json!({
                "id": i.id,
                "templateId": i.template_id,
                "goal": i.goal,
                "succeeded": i.succeeded,
                "steps": i.step_snapshots.len(),
            })).collect::<Vec<_>>(),
        })
    }
}

pub struct Pipeline {
    collaborator: Arc<dyn Collaborator>,
    segmenter: Box<dyn Segmenter>,
    settings: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        collaborator: Arc<dyn Collaborator>,
        segmenter: Box<dyn Segmenter>,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            collaborator,
            segmenter,
            settings,
        }
    }

    pub fn from_config(config: &TraceryConfig, collaborator: Arc<dyn Collaborator>) -> Self {
        let kind = SegmenterKind::from_config(&config.pipeline.segmenter);
        let segmenter = create_segmenter(kind, collaborator.clone());
        tracing::info!(
            segmenter = segmenter.name(),
            collaborator = collaborator.name(),
            "Pipeline ready"
        );
        Self::new(collaborator, segmenter, config.pipeline.clone())
    }

    pub fn segmenter_name(&self) -> &str {
        self.segmenter.name()
    }

    /// Run the whole pipeline over one session's events.
    pub async fn finalize(
        &self,
        pool: &SqlitePool,
        session_id: &str,
        mut events: Vec<CapturedEvent>,
    ) -> Result<FinalizeOutcome, TraceryError> {
        if events.is_empty() {
            tracing::info!(session_id = %session_id, "Nothing recorded, skipping finalize");
            return Ok(FinalizeOutcome::default());
        }

        let canonical = canonicalize(&mut events, self.collaborator.as_ref(), &self.settings).await;
        let screens = canonical.screens;

        let detected = self.segmenter.segment(&events, &screens).await;
        tracing::info!(
            session_id = %session_id,
            events = events.len(),
            screens = screens.len(),
            instances = detected.len(),
            segmenter = self.segmenter.name(),
            "Segmented session"
        );

        let mut workflows = Vec::with_capacity(detected.len());
        for instance in &detected {
            workflows.push(synthesize(instance, &screens, session_id, self.collaborator.as_ref()).await);
        }

        let mut tx = pool.begin().await?;
        persist::upsert_screens(&mut tx, &screens).await?;
        persist::insert_events(&mut tx, session_id, &events).await?;
        for workflow in &workflows {
            persist::persist_workflow(&mut tx, workflow).await?;
        }
        tx.commit().await?;

        let (templates, instances): (Vec<_>, Vec<_>) = workflows
            .into_iter()
            .map(|w| (w.template, w.instance))
            .unzip();

        tracing::info!(
            session_id = %session_id,
            templates = templates.len(),
            "Finalized session"
        );

        Ok(FinalizeOutcome {
            screens,
            templates,
            instances,
        })
    }
}
