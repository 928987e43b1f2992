//! Instance segmentation: split an ordered event stream into workflow attempts
//!
//! Two interchangeable strategies behind the `Segmenter` trait:
//! - **Heuristic**: base-screen state machine, no collaborator call, total.
//! - **Collaborator**: one collaborator call that picks goal-based boundaries.
//!
//! Both return `DetectedInstance`s sorted by start index.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracery_core::models::{screen_label, CanonicalScreen, CapturedEvent, DetectedInstance};
use tracery_core::{ask, Collaborator, CollaboratorError};

const SEGMENT_SYSTEM: &str = r#"You split a recorded browser session into the tasks the user was trying to accomplish.
You receive a JSON array of events: {index, screenType, eventType, action, inputValue?, inputName?}.
Reply with JSON only:
{"instances": [{"goal": "Register a new patient", "startEventIndex": 0, "endEventIndex": 7, "succeeded": true}]}
Goals describe the task generically. Indices are inclusive. Events that belong to no task may be left out."#;

const FALLBACK_GOAL: &str = "Browsing session";

// ============================================================================
// Segmenter trait / factory
// ============================================================================

#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Split `events` (already resolved to `screens`) into detected instances.
    async fn segment(
        &self,
        events: &[CapturedEvent],
        screens: &[CanonicalScreen],
    ) -> Vec<DetectedInstance>;

    /// Strategy name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterKind {
    Heuristic,
    Collaborator,
}

impl SegmenterKind {
    /// Parse the `[pipeline] segmenter` setting. Unknown values select the heuristic.
    pub fn from_config(value: &str) -> Self {
        match value {
            "collaborator" => SegmenterKind::Collaborator,
            "heuristic" => SegmenterKind::Heuristic,
            other => {
                tracing::warn!(segmenter = %other, "Unknown segmenter, using heuristic");
                SegmenterKind::Heuristic
            }
        }
    }
}

pub fn create_segmenter(
    kind: SegmenterKind,
    collaborator: Arc<dyn Collaborator>,
) -> Box<dyn Segmenter> {
    match kind {
        SegmenterKind::Heuristic => Box::new(HeuristicSegmenter),
        SegmenterKind::Collaborator => Box::new(CollaboratorSegmenter::new(collaborator)),
    }
}

// ============================================================================
// Heuristic strategy
// ============================================================================

/// Contiguous span found by the base-screen state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    /// Inclusive.
    pub end: usize,
    /// `true` when closed by a loop or a return to base, `false` when flushed
    /// at end of stream.
    pub closed: bool,
}

/// Keys ordered by descending frequency; ties keep first-appearance order.
pub fn rank_by_frequency<K: Copy + Eq + Hash>(keys: &[K]) -> Vec<(K, usize)> {
    let mut counts: HashMap<K, usize> = HashMap::new();
    let mut order: Vec<K> = Vec::new();
    for key in keys {
        let count = counts.entry(*key).or_insert(0);
        if *count == 0 {
            order.push(*key);
        }
        *count += 1;
    }

    let mut ranked: Vec<(K, usize)> = order.into_iter().map(|k| (k, counts[&k])).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

/// The runner-up is a base screen only with at least half the top count and
/// more than one occurrence.
pub fn is_second_base(top_count: usize, second_count: usize) -> bool {
    second_count * 2 >= top_count && second_count > 1
}

/// The most frequent key, plus the runner-up when `is_second_base` holds.
pub fn base_keys<K: Copy + Eq + Hash>(keys: &[K]) -> HashSet<K> {
    let ranked = rank_by_frequency(keys);
    let mut base = HashSet::new();
    if let Some(&(top, top_count)) = ranked.first() {
        base.insert(top);
        if let Some(&(second, second_count)) = ranked.get(1) {
            if is_second_base(top_count, second_count) {
                base.insert(second);
            }
        }
    }
    base
}

struct OpenSpan<K> {
    start: usize,
    end: usize,
    seen: HashSet<K>,
}

/// Run the base-screen state machine over a sequence of screen keys.
///
/// A span opens on a base → non-base transition (the base event itself is not
/// part of it). It closes on the first repeated screen, which is included
/// unless it is a base screen, or on a return to base, which is not included.
/// A span still open at the end of the stream is flushed.
pub fn split_on_base_screens<K: Copy + Eq + Hash>(keys: &[K]) -> Vec<Span> {
    if keys.len() <= 1 {
        return Vec::new();
    }

    let base = base_keys(keys);
    let mut spans = Vec::new();
    let mut open: Option<OpenSpan<K>> = None;

    for i in 1..keys.len() {
        let prev_base = base.contains(&keys[i - 1]);
        let cur_base = base.contains(&keys[i]);

        if prev_base && !cur_base {
            open = Some(OpenSpan {
                start: i,
                end: i,
                seen: HashSet::from([keys[i]]),
            });
            continue;
        }

        let Some(current) = open.as_mut() else {
            continue;
        };

        if current.seen.contains(&keys[i]) {
            if !cur_base {
                current.end = i;
            }
            spans.push(Span {
                start: current.start,
                end: current.end,
                closed: true,
            });
            open = None;
        } else if !prev_base && cur_base {
            spans.push(Span {
                start: current.start,
                end: current.end,
                closed: true,
            });
            open = None;
        } else {
            current.end = i;
            current.seen.insert(keys[i]);
        }
    }

    if let Some(current) = open {
        spans.push(Span {
            start: current.start,
            end: current.end,
            closed: false,
        });
    }

    spans
}

/// Local frequency/loop heuristic. Never calls the collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSegmenter;

#[async_trait]
impl Segmenter for HeuristicSegmenter {
    async fn segment(
        &self,
        events: &[CapturedEvent],
        screens: &[CanonicalScreen],
    ) -> Vec<DetectedInstance> {
        let keys: Vec<_> = events.iter().map(|e| e.screen_id).collect();
        let instances: Vec<DetectedInstance> = split_on_base_screens(&keys)
            .into_iter()
            .map(|span| {
                let slice = &events[span.start..=span.end];
                DetectedInstance {
                    goal: heuristic_goal(slice, screens),
                    start_event_index: span.start,
                    end_event_index: span.end,
                    succeeded: span.closed,
                    events: slice.to_vec(),
                }
            })
            .collect();

        tracing::debug!(events = events.len(), instances = instances.len(), "Heuristic segmentation");
        instances
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Distinct screen labels of the span, in visiting order.
fn heuristic_goal(events: &[CapturedEvent], screens: &[CanonicalScreen]) -> String {
    let mut labels: Vec<String> = Vec::new();
    for event in events {
        let label = screen_label(screens, event.screen_id);
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels.join(" → ")
}

// ============================================================================
// Collaborator strategy
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventSummary {
    index: usize,
    screen_type: String,
    event_type: &'static str,
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentationResponse {
    instances: Vec<InstanceBoundary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceBoundary {
    goal: String,
    start_event_index: i64,
    end_event_index: i64,
    #[serde(default = "default_succeeded")]
    succeeded: bool,
}

fn default_succeeded() -> bool {
    true
}

/// Goal-based boundaries chosen by the collaborator. Coverage is not
/// guaranteed: gaps and omitted events are accepted as returned.
pub struct CollaboratorSegmenter {
    collaborator: Arc<dyn Collaborator>,
}

impl CollaboratorSegmenter {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }

    async fn request_boundaries(
        &self,
        events: &[CapturedEvent],
        screens: &[CanonicalScreen],
    ) -> Result<Vec<DetectedInstance>, CollaboratorError> {
        let summaries: Vec<EventSummary> = events
            .iter()
            .enumerate()
            .map(|(index, event)| EventSummary {
                index,
                screen_type: screen_label(screens, event.screen_id),
                event_type: event.event_type.as_str(),
                action: event.describe_action(),
                input_value: event.typed_value().map(str::to_string),
                input_name: event.field_name().map(str::to_string),
            })
            .collect();

        let response: SegmentationResponse =
            ask(self.collaborator.as_ref(), SEGMENT_SYSTEM, &summaries).await?;

        let last = (events.len() - 1) as i64;
        let mut instances = Vec::with_capacity(response.instances.len());
        for boundary in response.instances {
            let goal = boundary.goal.trim();
            if goal.is_empty() {
                return Err(CollaboratorError::Schema("instance without goal".to_string()));
            }

            let mut start = boundary.start_event_index.clamp(0, last) as usize;
            let mut end = boundary.end_event_index.clamp(0, last) as usize;
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }

            instances.push(DetectedInstance {
                goal: goal.to_string(),
                start_event_index: start,
                end_event_index: end,
                succeeded: boundary.succeeded,
                events: events[start..=end].to_vec(),
            });
        }

        instances.sort_by_key(|i| i.start_event_index);
        Ok(instances)
    }
}

#[async_trait]
impl Segmenter for CollaboratorSegmenter {
    async fn segment(
        &self,
        events: &[CapturedEvent],
        screens: &[CanonicalScreen],
    ) -> Vec<DetectedInstance> {
        match events {
            [] => Vec::new(),
            [only] => vec![DetectedInstance {
                goal: screen_label(screens, only.screen_id),
                start_event_index: 0,
                end_event_index: 0,
                succeeded: true,
                events: vec![only.clone()],
            }],
            _ => match self.request_boundaries(events, screens).await {
                Ok(instances) => {
                    tracing::info!(
                        events = events.len(),
                        instances = instances.len(),
                        backend = self.collaborator.name(),
                        "Collaborator segmentation"
                    );
                    instances
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Segmentation failed, treating the whole session as one instance"
                    );
                    vec![DetectedInstance {
                        goal: FALLBACK_GOAL.to_string(),
                        start_event_index: 0,
                        end_event_index: events.len() - 1,
                        succeeded: true,
                        events: events.to_vec(),
                    }]
                }
            },
        }
    }

    fn name(&self) -> &str {
        "collaborator"
    }
}

// ============================================================================
// TESTS
// ============================================================================
