//! Projection view model and its deterministic fold.
//!
//! The view is a pure function of the event and tool-audit prefixes it has
//! observed: [`ProjectionView::apply_event`] and
//! [`ProjectionView::apply_audit`] read no clock and consult no state other
//! than the view itself, so replaying the same prefix from an empty view
//! always yields the same canonical bytes. Wall-clock stamps (`timestamp`,
//! `last_updated_at`) are written by the projector at publish time and are
//! informational only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// Version of the view document schema.
pub const PROJECTION_SCHEMA_VERSION: u32 = 1;

/// Queue depth at which `stress_level` saturates.
const STRESS_SATURATION_QUEUE: f64 = 25.0;

/// Consecutive missed heartbeats after which a worker is presumed offline.
const OFFLINE_MISSED_HEARTBEATS: u64 = 2;

/// Worker state as observed by the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Known but not currently doing anything observable.
    Idle,
    /// Running and processing.
    Active,
    /// Restart scheduled by the supervisor.
    Restarting,
    /// Exited or presumed dead.
    Offline,
}

/// Whether the office (the supervised swarm) is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfficeMode {
    /// A supervisor is active.
    Running,
    /// No supervisor is active.
    Paused,
}

/// Per-worker state derived from the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    /// Whether the worker currently has a live process.
    pub present: bool,
    /// Derived worker state.
    pub state: WorkerState,
    /// Type of the last event attributed to this worker.
    pub last_event_type: Option<String>,
    /// Timestamp of the last event attributed to this worker.
    pub last_event_at: Option<String>,
    /// Restarts observed for this worker.
    pub restart_count: u64,
    /// Missed heartbeats observed for this worker.
    pub missed_heartbeat_count: u64,
    /// Id of the last event attributed to this worker.
    pub last_seen_event_id: i64,
}

impl Default for WorkerView {
    fn default() -> Self {
        Self {
            present: false,
            state: WorkerState::Idle,
            last_event_type: None,
            last_event_at: None,
            restart_count: 0,
            missed_heartbeat_count: 0,
            last_seen_event_id: 0,
        }
    }
}

/// Allowed/denied tallies for the tool-audit log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAuditCounts {
    /// Audit rows with `allowed = true`.
    pub allowed: u64,
    /// Audit rows with `allowed = false`.
    pub denied: u64,
}

/// Snapshot of the newest observed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Publish timestamp.
    pub timestamp: String,
    /// Publisher.
    pub origin_id: String,
    /// Payload as stored.
    pub payload: Value,
}

impl CurrentEvent {
    /// Snapshot an event row.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_type: event.event_type.clone(),
            timestamp: event.ts.clone(),
            origin_id: event.origin_id.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Values derived from the rest of the view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedState {
    /// `RUNNING` while a supervisor is active.
    pub office_mode: OfficeMode,
    /// Backlog pressure in `[0, 1]`: `min(event_queue_size / 25, 1)`.
    pub stress_level: f64,
}

impl Default for DerivedState {
    fn default() -> Self {
        Self {
            office_mode: OfficeMode::Paused,
            stress_level: 0.0,
        }
    }
}

/// The materialized read-only view consumed by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionView {
    /// Fixed document schema version.
    pub schema_version: u32,
    /// Wall-clock stamp written at publish time (informational).
    pub timestamp: String,
    /// Wall-clock stamp written at publish time (informational).
    pub last_updated_at: String,
    /// Cursor: highest event id folded so far.
    pub last_seen_event_id: i64,
    /// Cursor: highest tool-audit id folded so far.
    pub last_seen_tool_audit_id: i64,
    /// Whether a supervisor is active.
    pub running: bool,
    /// Number of PENDING events at publish time.
    pub event_queue_size: u64,
    /// Snapshot of the newest observed event.
    pub current_event: Option<CurrentEvent>,
    /// Total events folded.
    pub events_processed: u64,
    /// Count per event type.
    pub event_type_counts: BTreeMap<String, u64>,
    /// Allowed/denied audit tallies.
    pub tool_audit_counts: ToolAuditCounts,
    /// Per-worker derived state.
    pub workers: BTreeMap<String, WorkerView>,
    /// Values derived from the rest of the view.
    pub derived: DerivedState,
}

impl Default for ProjectionView {
    fn default() -> Self {
        Self {
            schema_version: PROJECTION_SCHEMA_VERSION,
            timestamp: String::new(),
            last_updated_at: String::new(),
            last_seen_event_id: 0,
            last_seen_tool_audit_id: 0,
            running: false,
            event_queue_size: 0,
            current_event: None,
            events_processed: 0,
            event_type_counts: BTreeMap::new(),
            tool_audit_counts: ToolAuditCounts::default(),
            workers: BTreeMap::new(),
            derived: DerivedState::default(),
        }
    }
}

impl ProjectionView {
    /// Fold one event into the view.
    ///
    /// Events must be applied in ascending id order; the cursor only moves
    /// forward.
    pub fn apply_event(&mut self, event: &Event) {
        let event_type = event.event_type.trim().to_ascii_uppercase();
        if !event_type.is_empty() {
            *self.event_type_counts.entry(event_type.clone()).or_insert(0) += 1;
        }
        self.events_processed += 1;

        match event_type.as_str() {
            "SUPERVISOR_START" => self.running = true,
            "SUPERVISOR_STOP" => self.running = false,
            _ => {},
        }

        if let Some(worker_id) = event.worker_id() {
            let worker = self.workers.entry(worker_id).or_default();

            match event_type.as_str() {
                "WORKER_STARTED" => {
                    worker.present = true;
                    worker.state = WorkerState::Active;
                    worker.missed_heartbeat_count = 0;
                },
                "WORKER_RESTART_SCHEDULED" => {
                    worker.state = WorkerState::Restarting;
                },
                "WORKER_RESTARTED" => {
                    worker.present = true;
                    worker.state = WorkerState::Active;
                    worker.restart_count += 1;
                    worker.missed_heartbeat_count = 0;
                },
                "WORKER_EXITED" => {
                    worker.present = false;
                    worker.state = WorkerState::Offline;
                },
                "WORKER_HEARTBEAT_MISSED" => {
                    worker.missed_heartbeat_count += 1;
                    if worker.missed_heartbeat_count >= OFFLINE_MISSED_HEARTBEATS {
                        worker.state = WorkerState::Offline;
                        worker.present = false;
                    }
                },
                _ => {},
            }

            worker.last_event_type = Some(event_type);
            worker.last_event_at = Some(event.ts.clone());
            worker.last_seen_event_id = event.id;
        }

        if event.id > self.last_seen_event_id {
            self.last_seen_event_id = event.id;
            self.current_event = Some(CurrentEvent::from_event(event));
        }
        self.refresh_derived();
    }

    /// Fold one tool-audit decision into the view.
    pub fn apply_audit(&mut self, audit_id: i64, allowed: bool) {
        if allowed {
            self.tool_audit_counts.allowed += 1;
        } else {
            self.tool_audit_counts.denied += 1;
        }
        if audit_id > self.last_seen_tool_audit_id {
            self.last_seen_tool_audit_id = audit_id;
        }
    }

    /// Fold a batch of events in id order.
    pub fn fold_events<'a, I: IntoIterator<Item = &'a Event>>(&mut self, events: I) {
        for event in events {
            self.apply_event(event);
        }
    }

    /// Update the PENDING backlog figure and the values derived from it.
    pub fn set_queue_size(&mut self, pending: u64) {
        self.event_queue_size = pending;
        self.refresh_derived();
    }

    /// Recompute `derived` from the rest of the view.
    pub fn refresh_derived(&mut self) {
        self.derived.office_mode = if self.running {
            OfficeMode::Running
        } else {
            OfficeMode::Paused
        };
        #[allow(clippy::cast_precision_loss)] // queue sizes stay far below 2^52
        let ratio = self.event_queue_size as f64 / STRESS_SATURATION_QUEUE;
        self.derived.stress_level = ratio.min(1.0);
    }

    /// Canonical (sorted-key, compact) JSON bytes of this view.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        crate::canonical::to_canonical_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::EventStatus;

    fn event(id: i64, event_type: &str, agent: Option<&str>) -> Event {
        Event {
            id,
            ts: format!("2026-02-19T10:00:{:02}Z", id % 60),
            event_type: event_type.to_string(),
            origin_id: "supervisor".to_string(),
            target_agent: Some("command".to_string()),
            payload: agent.map_or_else(|| json!({}), |a| json!({ "agent_id": a })),
            justification: None,
            status: EventStatus::Done,
            error: None,
            correlation_id: None,
            retry_count: 0,
        }
    }

    #[test]
    fn supervisor_events_toggle_running() {
        let mut view = ProjectionView::default();
        view.apply_event(&event(1, "SUPERVISOR_START", None));
        assert!(view.running);
        assert_eq!(view.derived.office_mode, OfficeMode::Running);

        view.apply_event(&event(2, "SUPERVISOR_STOP", None));
        assert!(!view.running);
        assert_eq!(view.derived.office_mode, OfficeMode::Paused);
    }

    #[test]
    fn worker_lifecycle_transitions() {
        let mut view = ProjectionView::default();
        view.apply_event(&event(1, "WORKER_STARTED", Some("forge")));
        {
            let worker = &view.workers["forge"];
            assert!(worker.present);
            assert_eq!(worker.state, WorkerState::Active);
        }

        view.apply_event(&event(2, "WORKER_RESTART_SCHEDULED", Some("forge")));
        assert_eq!(view.workers["forge"].state, WorkerState::Restarting);

        view.apply_event(&event(3, "WORKER_RESTARTED", Some("forge")));
        {
            let worker = &view.workers["forge"];
            assert!(worker.present);
            assert_eq!(worker.state, WorkerState::Active);
            assert_eq!(worker.restart_count, 1);
        }

        view.apply_event(&event(4, "WORKER_EXITED", Some("forge")));
        {
            let worker = &view.workers["forge"];
            assert!(!worker.present);
            assert_eq!(worker.state, WorkerState::Offline);
        }
    }

    #[test]
    fn two_missed_heartbeats_mark_offline() {
        let mut view = ProjectionView::default();
        view.apply_event(&event(1, "WORKER_STARTED", Some("recon")));
        view.apply_event(&event(2, "WORKER_HEARTBEAT_MISSED", Some("recon")));
        {
            let worker = &view.workers["recon"];
            assert_eq!(worker.missed_heartbeat_count, 1);
            assert!(worker.present);
        }

        view.apply_event(&event(3, "WORKER_HEARTBEAT_MISSED", Some("recon")));
        {
            let worker = &view.workers["recon"];
            assert_eq!(worker.missed_heartbeat_count, 2);
            assert_eq!(worker.state, WorkerState::Offline);
            assert!(!worker.present);
        }
    }

    #[test]
    fn counters_and_cursor_advance() {
        let mut view = ProjectionView::default();
        view.apply_event(&event(1, "SUPERVISOR_HEARTBEAT", Some("recon")));
        view.apply_event(&event(2, "SUPERVISOR_HEARTBEAT", Some("forge")));
        view.apply_event(&event(3, "TOOL_RESULT", Some("forge")));

        assert_eq!(view.event_type_counts["SUPERVISOR_HEARTBEAT"], 2);
        assert_eq!(view.event_type_counts["TOOL_RESULT"], 1);
        assert_eq!(view.events_processed, 3);
        assert_eq!(view.last_seen_event_id, 3);
        assert_eq!(
            view.current_event.as_ref().unwrap().event_type,
            "TOOL_RESULT"
        );
        assert_eq!(view.workers["forge"].last_seen_event_id, 3);
        assert_eq!(
            view.workers["forge"].last_event_type.as_deref(),
            Some("TOOL_RESULT")
        );
    }

    #[test]
    fn audit_counts() {
        let mut view = ProjectionView::default();
        view.apply_audit(1, true);
        view.apply_audit(2, false);
        view.apply_audit(3, false);
        assert_eq!(view.tool_audit_counts.allowed, 1);
        assert_eq!(view.tool_audit_counts.denied, 2);
        assert_eq!(view.last_seen_tool_audit_id, 3);
    }

    #[test]
    fn stress_level_saturates() {
        let mut view = ProjectionView::default();
        view.set_queue_size(5);
        assert!((view.derived.stress_level - 0.2).abs() < 1e-12);
        view.set_queue_size(100);
        assert!((view.derived.stress_level - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fold_is_deterministic() {
        let events: Vec<Event> = vec![
            event(1, "SUPERVISOR_START", None),
            event(2, "WORKER_STARTED", Some("recon")),
            event(3, "WORKER_HEARTBEAT_MISSED", Some("recon")),
            event(4, "WORKER_RESTART_SCHEDULED", Some("recon")),
            event(5, "WORKER_RESTARTED", Some("recon")),
            event(6, "SUPERVISOR_STOP", None),
        ];

        let mut first = ProjectionView::default();
        first.fold_events(&events);
        first.apply_audit(1, true);

        let mut second = ProjectionView::default();
        second.fold_events(&events);
        second.apply_audit(1, true);

        assert_eq!(
            first.to_canonical_json().unwrap(),
            second.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn view_round_trips_through_json() {
        let mut view = ProjectionView::default();
        view.apply_event(&event(1, "WORKER_STARTED", Some("recon")));
        view.set_queue_size(3);

        let json = view.to_canonical_json().unwrap();
        let parsed: ProjectionView = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, view);
    }
}
