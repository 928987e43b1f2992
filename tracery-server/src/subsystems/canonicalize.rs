//! Screen canonicalization: raw events → canonical screens
//!
//! 1. Every event URL is reduced to a path shape (`/patients/*/edit`).
//! 2. Events are grouped by shape; this partition is deterministic and never
//!    depends on the collaborator.
//! 3. One collaborator call labels the groups, possibly merging several
//!    groups into one screen.
//! 4. Every event is mapped back to its screen through its URL shape.
//!
//! On any collaborator failure each group becomes its own "Screen N".

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracery_core::config::PipelineConfig;
use tracery_core::models::{CanonicalScreen, CapturedEvent};
use tracery_core::{ask, Collaborator, CollaboratorError};
use url::Url;
use uuid::Uuid;

const CANONICALIZE_SYSTEM: &str = r#"You label the screens of a web application from recorded browser activity.
You receive a JSON array of URL groups: {groupId, urlPattern, sampleUrls, eventCount, sampleActions}.
Groups that show the same kind of screen should share one label.
Reply with JSON only:
{"screenTypes": [{"groupIds": [0, 2], "canonicalLabel": "Patient Detail Page", "description": "One sentence"}]}
Labels name the kind of screen, never a specific record."#;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Result of canonicalizing one session's events.
#[derive(Debug, Clone, Default)]
pub struct CanonicalizeOutput {
    pub screens: Vec<CanonicalScreen>,
    /// Event index → screen id, one entry per event.
    pub event_screen_mappings: BTreeMap<usize, Uuid>,
}

/// Events sharing one normalized URL shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlGroup {
    pub id: usize,
    pub pattern: String,
    pub event_indices: Vec<usize>,
}

/// Canonicalize `events`, assigning every event's `screen_id` as a side effect.
///
/// Never fails: a collaborator error only degrades the labels.
pub async fn canonicalize(
    events: &mut [CapturedEvent],
    collaborator: &dyn Collaborator,
    settings: &PipelineConfig,
) -> CanonicalizeOutput {
    if events.is_empty() {
        return CanonicalizeOutput::default();
    }

    let groups = group_by_pattern(events);
    let summaries = summarize_groups(&groups, events, settings);

    let screens = match ask::<_, CanonicalizationResponse>(collaborator, CANONICALIZE_SYSTEM, &summaries)
        .await
        .and_then(|response| screens_from_response(&groups, events, response))
    {
        Ok(screens) => {
            tracing::info!(
                groups = groups.len(),
                screens = screens.len(),
                backend = collaborator.name(),
                "Canonicalized screens"
            );
            screens
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                groups = groups.len(),
                "Screen labelling failed, falling back to one screen per URL pattern"
            );
            fallback_screens(&groups, events)
        }
    };

    let mappings = assign_screens(&groups, &screens, events);

    CanonicalizeOutput {
        screens,
        event_screen_mappings: mappings,
    }
}

/// Reduce a URL to its path shape. Opaque identifiers become `*`.
///
/// Numeric ids, UUIDs and tokens of 8+ ASCII alphanumerics collapse. A token
/// must contain at least one digit to count as opaque, so all-letter
/// segments like `settings` or `abcdefgh` stay literal.
pub fn normalize_url(raw: &str) -> String {
    let path = match Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(normalize_segment)
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Group events by URL shape, in order of first appearance.
pub fn group_by_pattern(events: &[CapturedEvent]) -> Vec<UrlGroup> {
    let mut groups: Vec<UrlGroup> = Vec::new();
    let mut by_pattern: HashMap<String, usize> = HashMap::new();

    for (index, event) in events.iter().enumerate() {
        let pattern = normalize_url(&event.url);
        let slot = *by_pattern.entry(pattern.clone()).or_insert_with(|| {
            groups.push(UrlGroup {
                id: groups.len(),
                pattern,
                event_indices: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].event_indices.push(index);
    }

    groups
}

// ============================================================================
// Collaborator request / response
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupSummary {
    group_id: usize,
    url_pattern: String,
    sample_urls: Vec<String>,
    event_count: usize,
    sample_actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalizationResponse {
    screen_types: Vec<ScreenType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenType {
    group_ids: Vec<usize>,
    canonical_label: String,
    #[serde(default)]
    description: String,
}

fn summarize_groups(
    groups: &[UrlGroup],
    events: &[CapturedEvent],
    settings: &PipelineConfig,
) -> Vec<GroupSummary> {
    groups
        .iter()
        .map(|group| {
            let mut sample_urls: Vec<String> = Vec::new();
            let mut sample_actions: Vec<String> = Vec::new();
            for &i in &group.event_indices {
                let event = &events[i];
                if sample_urls.len() < settings.max_sample_urls && !sample_urls.contains(&event.url) {
                    sample_urls.push(event.url.clone());
                }
                let action = event.describe_action();
                if sample_actions.len() < settings.max_sample_actions
                    && !sample_actions.contains(&action)
                {
                    sample_actions.push(action);
                }
            }
            GroupSummary {
                group_id: group.id,
                url_pattern: group.pattern.clone(),
                sample_urls,
                event_count: group.event_indices.len(),
                sample_actions,
            }
        })
        .collect()
}

/// Turn the collaborator's clusters into screens. Groups left out of every
/// cluster become singleton screens; unknown group ids are ignored and a group
/// claimed twice stays with its first cluster.
fn screens_from_response(
    groups: &[UrlGroup],
    events: &[CapturedEvent],
    response: CanonicalizationResponse,
) -> Result<Vec<CanonicalScreen>, CollaboratorError> {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut screens = Vec::new();

    for screen_type in response.screen_types {
        let label = screen_type.canonical_label.trim();
        if label.is_empty() {
            return Err(CollaboratorError::Schema(
                "screen type without canonicalLabel".to_string(),
            ));
        }

        let members: Vec<&UrlGroup> = screen_type
            .group_ids
            .iter()
            .filter_map(|id| groups.get(*id))
            .filter(|g| claimed.insert(g.id))
            .collect();

        if members.is_empty() {
            tracing::debug!(label = %label, "Screen type matched no unclaimed group, skipping");
            continue;
        }

        screens.push(build_screen(label, screen_type.description.trim(), &members, events));
    }

    for group in groups.iter().filter(|g| !claimed.contains(&g.id)) {
        screens.push(build_screen(
            &group.pattern,
            &format!("Screens matching {}", group.pattern),
            &[group],
            events,
        ));
    }

    Ok(screens)
}

fn fallback_screens(groups: &[UrlGroup], events: &[CapturedEvent]) -> Vec<CanonicalScreen> {
    groups
        .iter()
        .enumerate()
        .map(|(n, group)| {
            build_screen(
                &format!("Screen {}", n + 1),
                &format!("Screens matching {}", group.pattern),
                &[group],
                events,
            )
        })
        .collect()
}

fn build_screen(
    label: &str,
    description: &str,
    members: &[&UrlGroup],
    events: &[CapturedEvent],
) -> CanonicalScreen {
    let mut screen = CanonicalScreen::new(label, description);
    for group in members {
        screen.add_pattern(&group.pattern);
    }

    let mut indices: Vec<usize> = members
        .iter()
        .flat_map(|g| g.event_indices.iter().copied())
        .collect();
    indices.sort_unstable();
    screen.example_screenshot_path = indices
        .into_iter()
        .find_map(|i| events[i].screenshot_path.clone());

    screen
}

fn assign_screens(
    groups: &[UrlGroup],
    screens: &[CanonicalScreen],
    events: &mut [CapturedEvent],
) -> BTreeMap<usize, Uuid> {
    let by_pattern: HashMap<&str, Uuid> = screens
        .iter()
        .flat_map(|s| s.url_patterns.iter().map(move |p| (p.as_str(), s.id)))
        .collect();

    let mut mappings = BTreeMap::new();
    for group in groups {
        let Some(&screen_id) = by_pattern.get(group.pattern.as_str()) else {
            continue;
        };
        for &index in &group.event_indices {
            if !events[index].assign_screen(screen_id) {
                tracing::warn!(index, "Event already carried a screen id, keeping it");
            }
            if let Some(id) = events[index].screen_id {
                mappings.insert(index, id);
            }
        }
    }
    mappings
}

// ============================================================================
// URL segment normalization
// ============================================================================

fn id_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
            r"^[0-9]+$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 8+ ASCII alphanumerics with at least one digit, e.g. `a8f3kd92`.
fn is_opaque_token(segment: &str) -> bool {
    segment.len() >= 8
        && segment.chars().all(|c| c.is_ascii_alphanumeric())
        && segment.chars().any(|c| c.is_ascii_digit())
}

fn normalize_segment(segment: &str) -> String {
    if is_opaque_token(segment) || id_patterns().iter().any(|re| re.is_match(segment)) {
        "*".to_string()
    } else {
        segment.to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================
