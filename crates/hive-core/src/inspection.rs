//! Inspection index: per-entity summaries and timelines derived from the
//! projection view and a recent window of events.
//!
//! The index is rebuilt from scratch on every projector tick, so the same
//! `(view, events)` input always produces the same document; the content
//! hash makes that verifiable by downstream consumers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_hash;
use crate::event::Event;
use crate::view::ProjectionView;

/// Default page size for a single entity's timeline.
pub const ENTITY_TIMELINE_DEFAULT_LIMIT: u32 = 25;

/// Default page size for the office-wide timeline.
pub const OFFICE_TIMELINE_DEFAULT_LIMIT: u32 = 50;

/// Hard cap on any timeline page.
const TIMELINE_PAGE_CAP: u32 = 500;

/// One row of a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Upper-cased event type.
    pub entry_type: String,
    /// Publish timestamp of the event.
    pub timestamp: String,
    /// Event id; timelines sort ascending on this.
    pub event_id: i64,
    /// Entities the event is attributed to (sorted, lower-cased).
    pub entity_ids: Vec<String>,
    /// Event payload as stored.
    pub payload: Value,
}

impl TimelineEntry {
    fn from_event(event: &Event) -> Self {
        Self {
            entry_type: event.event_type.trim().to_ascii_uppercase(),
            timestamp: event.ts.clone(),
            event_id: event.id,
            entity_ids: entity_ids_for(event),
            payload: event.payload.clone(),
        }
    }
}

/// Summary of one worker entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    /// Entity id (worker id).
    pub id: String,
    /// Fixed discriminator for consumers that also render areas.
    pub entity_type: String,
    /// Role label; every supervised worker reports as `worker`.
    pub role: String,
    /// Whether the worker currently has a live process.
    pub present: bool,
    /// Derived worker state as text.
    pub state: String,
    /// Type of the last event attributed to this entity.
    pub last_event_type: Option<String>,
    /// Timestamp of the last event attributed to this entity.
    pub last_event_at: Option<String>,
    /// Restarts observed.
    pub restart_count: u64,
    /// Missed heartbeats observed.
    pub missed_heartbeat_count: u64,
    /// Number of timeline rows attributed to this entity.
    pub timeline_total: u64,
}

/// Pagination defaults advertised to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Default page size for entity timelines.
    pub entity_timeline_default_limit: u32,
    /// Default page size for the office timeline.
    pub office_timeline_default_limit: u32,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            entity_timeline_default_limit: ENTITY_TIMELINE_DEFAULT_LIMIT,
            office_timeline_default_limit: OFFICE_TIMELINE_DEFAULT_LIMIT,
        }
    }
}

/// The inspection index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionIndex {
    /// Stamp copied from the view that produced this index.
    pub generated_at: String,
    /// Per-entity summaries keyed by entity id.
    pub entities: BTreeMap<String, EntitySummary>,
    /// Sorted entity ids.
    pub entity_ids: Vec<String>,
    /// Office-wide timeline, ascending by event id.
    pub office_timeline: Vec<TimelineEntry>,
    /// Pagination defaults.
    pub cursor_state: CursorState,
    /// Content hash of the index body (computed with this field absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_hash: Option<String>,
}

/// One page of a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePage {
    /// Rows in this page.
    pub items: Vec<TimelineEntry>,
    /// Cursor this page starts at.
    pub cursor: String,
    /// Cursor of the next page, when one exists.
    pub next_cursor: Option<String>,
    /// Total rows in the timeline.
    pub total: u64,
}

/// Build the inspection index from the view plus a recent window of events.
///
/// # Errors
///
/// Returns a serialization error if the index cannot be hashed.
pub fn build_inspection_index(
    view: &ProjectionView,
    events: &[Event],
) -> Result<InspectionIndex, serde_json::Error> {
    let mut office_timeline: Vec<TimelineEntry> = events
        .iter()
        .filter(|event| !event.event_type.trim().is_empty())
        .map(TimelineEntry::from_event)
        .collect();
    office_timeline.sort_by_key(|entry| entry.event_id);

    let mut entities = BTreeMap::new();
    for (worker_id, worker) in &view.workers {
        let timeline_total = office_timeline
            .iter()
            .filter(|entry| entry.entity_ids.iter().any(|id| id == worker_id))
            .count() as u64;
        entities.insert(
            worker_id.clone(),
            EntitySummary {
                id: worker_id.clone(),
                entity_type: "agent".to_string(),
                role: "worker".to_string(),
                present: worker.present,
                state: format!("{:?}", worker.state).to_ascii_uppercase(),
                last_event_type: worker.last_event_type.clone(),
                last_event_at: worker.last_event_at.clone(),
                restart_count: worker.restart_count,
                missed_heartbeat_count: worker.missed_heartbeat_count,
                timeline_total,
            },
        );
    }

    let mut index = InspectionIndex {
        generated_at: view.timestamp.clone(),
        entity_ids: entities.keys().cloned().collect(),
        entities,
        office_timeline,
        cursor_state: CursorState::default(),
        index_hash: None,
    };
    index.index_hash = Some(canonical_hash(&index)?);
    Ok(index)
}

/// Rows of the office timeline attributed to one entity.
#[must_use]
pub fn entity_timeline<'a>(
    index: &'a InspectionIndex,
    entity_id: &str,
) -> Vec<&'a TimelineEntry> {
    let normalized = entity_id.trim().to_ascii_lowercase();
    index
        .office_timeline
        .iter()
        .filter(|entry| entry.entity_ids.iter().any(|id| *id == normalized))
        .collect()
}

/// Paginate a timeline with an opaque numeric cursor.
///
/// `cursor` is the stringified start offset handed back from a previous
/// page; anything unparsable restarts from the beginning.
#[must_use]
pub fn paginate_timeline(
    timeline: &[TimelineEntry],
    limit: u32,
    cursor: Option<&str>,
) -> TimelinePage {
    let page_limit = limit.clamp(1, TIMELINE_PAGE_CAP) as usize;
    let start = cursor
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(timeline.len());

    let end = (start + page_limit).min(timeline.len());
    let next_cursor = (end < timeline.len()).then(|| end.to_string());

    TimelinePage {
        items: timeline[start..end].to_vec(),
        cursor: start.to_string(),
        next_cursor,
        total: timeline.len() as u64,
    }
}

fn entity_ids_for(event: &Event) -> Vec<String> {
    let mut ids = std::collections::BTreeSet::new();
    for key in ["agent_id", "target_agent", "worker"] {
        if let Some(value) = event.payload.get(key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                ids.insert(trimmed.to_ascii_lowercase());
            }
        }
    }
    if let Some(target) = event.target_agent.as_deref() {
        let trimmed = target.trim();
        if !trimmed.is_empty() {
            ids.insert(trimmed.to_ascii_lowercase());
        }
    }
    let origin = event.origin_id.trim();
    if !origin.is_empty() {
        ids.insert(origin.to_ascii_lowercase());
    }
    ids.into_iter().collect()
}
