use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use tracery_core::ipc::{TraceryRequest, TraceryResponse};
use tracery_core::models::CapturedEvent;
use uuid::Uuid;

use crate::session::SessionStore;
use crate::subsystems::finalize::Pipeline;
use crate::subsystems::persist;

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub sessions: Arc<SessionStore>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pool: SqlitePool, pipeline: Pipeline) -> Self {
        Self {
            pool,
            sessions: Arc::new(SessionStore::new()),
            pipeline: Arc::new(pipeline),
        }
    }
}

pub async fn handle_request(request: TraceryRequest, state: &AppState) -> TraceryResponse {
    match request {
        TraceryRequest::Ping => TraceryResponse::pong(),
        TraceryRequest::Health => match tracery_core::db::health_check(&state.pool).await {
            Ok(version) => TraceryResponse::ok(json!({
                "sqlite": version,
                "status": "healthy"
            })),
            Err(e) => TraceryResponse::err(format!("DB Health Check failed: {}", e)),
        },
        TraceryRequest::StartRecording { session_id } => match state.sessions.start(&session_id) {
            Ok(()) => TraceryResponse::ok(json!({ "session_id": session_id, "recording": true })),
            Err(e) => TraceryResponse::err(e.to_string()),
        },
        TraceryRequest::RecordEvent { session_id, event } => {
            record_event(state, &session_id, event)
        }
        TraceryRequest::Finalize { session_id } => finalize(state, &session_id).await,
        TraceryRequest::DiscardSession { session_id } => {
            let existed = state.sessions.delete(&session_id);
            TraceryResponse::ok(json!({ "session_id": session_id, "discarded": existed }))
        }
        TraceryRequest::Stats => {
            let stats = state.sessions.stats();
            TraceryResponse::ok(json!({
                "active_sessions": stats.active_sessions,
                "total_events": stats.total_events,
                "finalizing_sessions": stats.finalizing_sessions,
                "segmenter": state.pipeline.segmenter_name(),
            }))
        }
        TraceryRequest::ListTemplates => match persist::list_templates(&state.pool).await {
            Ok(templates) => {
                let items: Vec<_> = templates
                    .iter()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "name": t.name,
                            "description": t.description,
                            "steps": t.steps.len(),
                            "created_at": t.created_at,
                        })
                    })
                    .collect();
                TraceryResponse::ok(json!({ "count": items.len(), "templates": items }))
            }
            Err(e) => TraceryResponse::err(e.to_string()),
        },
        TraceryRequest::GetTemplate { id } => get_template(state, id).await,
    }
}

fn record_event(state: &AppState, session_id: &str, mut event: CapturedEvent) -> TraceryResponse {
    // Screens are only ever assigned by canonicalization.
    if event.screen_id.take().is_some() {
        tracing::debug!(session_id = %session_id, "Ignoring client-supplied screen id");
    }
    match state.sessions.add_event(session_id, event) {
        Ok(count) => TraceryResponse::ok(json!({ "session_id": session_id, "event_count": count })),
        Err(e) => TraceryResponse::err(e.to_string()),
    }
}

/// Clears the finalizing mark on drop unless disarmed. Covers the error
/// path as well as a pipeline that panics or a request future that is
/// dropped mid-run.
struct FinalizeGuard<'a> {
    sessions: &'a SessionStore,
    session_id: &'a str,
    armed: bool,
}

impl<'a> FinalizeGuard<'a> {
    fn new(sessions: &'a SessionStore, session_id: &'a str) -> Self {
        Self {
            sessions,
            session_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(session_id = %self.session_id, "Finalize did not complete, session released");
            self.sessions.abort_finalize(self.session_id);
        }
    }
}

async fn finalize(state: &AppState, session_id: &str) -> TraceryResponse {
    let events = match state.sessions.begin_finalize(session_id) {
        Ok(events) => events,
        Err(e) => return TraceryResponse::err(e.to_string()),
    };
    let guard = FinalizeGuard::new(&state.sessions, session_id);

    match state.pipeline.finalize(&state.pool, session_id, events).await {
        Ok(outcome) => {
            guard.disarm();
            state.sessions.delete(session_id);
            let mut summary = outcome.summary();
            summary["session_id"] = json!(session_id);
            TraceryResponse::ok(summary)
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Finalize failed");
            // Nothing was stored; the guard reopens the session for a retry.
            drop(guard);
            TraceryResponse::err(format!("Finalize failed: {}", e))
        }
    }
}

async fn get_template(state: &AppState, id: Uuid) -> TraceryResponse {
    let template = match persist::get_template(&state.pool, id).await {
        Ok(Some(t)) => t,
        Ok(None) => return TraceryResponse::err(format!("template {} not found", id)),
        Err(e) => return TraceryResponse::err(e.to_string()),
    };
    match persist::list_instances(&state.pool, id).await {
        Ok(instances) => TraceryResponse::ok(json!({
            "template": template,
            "instances": instances,
        })),
        Err(e) => TraceryResponse::err(e.to_string()),
    }
}
