//! Event records used by the durable substrate.
//!
//! An [`Event`] is a durably stored, uniquely identified message describing
//! an action or observation. Ids are assigned by the mailstore at publish
//! time and are strictly monotonically increasing; they are the only ordering
//! authority in the system. Timestamps are informational.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time as an RFC 3339 string with microsecond precision.
///
/// Used for the informational `ts` columns only; nothing orders on it.
#[must_use]
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lifecycle status of an event.
///
/// Transitions: `Pending` → `Claimed` on claim, `Claimed` → `Done` on ack,
/// `Claimed` → `Failed` on fail, `Failed` → `Pending` on requeue while the
/// retry budget holds, `Failed` → `Dead` once it is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Published and available for claiming.
    Pending,
    /// Exclusively leased by one consumer.
    Claimed,
    /// Acknowledged; terminal.
    Done,
    /// Failed; may be requeued while the retry budget holds.
    Failed,
    /// Retry budget exhausted; terminal.
    Dead,
}

impl EventStatus {
    /// The SQL TEXT form of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Dead => "DEAD",
        }
    }

    /// Parse the SQL TEXT form back into a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "CLAIMED" => Some(Self::Claimed),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Returns `true` for statuses that never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored event row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing id assigned at publish.
    pub id: i64,

    /// RFC 3339 publish timestamp (informational).
    pub ts: String,

    /// Event type, upper-case by convention (e.g. `SUPERVISOR_START`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Identity of the publisher.
    pub origin_id: String,

    /// Routing target; `None` means unrouted.
    pub target_agent: Option<String>,

    /// Opaque JSON payload, persisted verbatim.
    pub payload: Value,

    /// Optional free-form justification supplied by the publisher.
    pub justification: Option<String>,

    /// Lifecycle status.
    pub status: EventStatus,

    /// Last failure message, if any.
    pub error: Option<String>,

    /// Correlates request/response event pairs.
    pub correlation_id: Option<String>,

    /// Number of requeues consumed from the retry budget.
    pub retry_count: u32,
}

impl Event {
    /// The worker this event is attributed to, if any.
    ///
    /// Control events carry the subject worker in `payload.agent_id` while
    /// being routed elsewhere, so the payload wins over the routing target.
    #[must_use]
    pub fn worker_id(&self) -> Option<String> {
        if let Some(agent) = non_empty_str(self.payload.get("agent_id")) {
            return Some(agent.to_ascii_lowercase());
        }
        self.target_agent
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().to_ascii_lowercase())
    }
}

/// Parameters for publishing a new event.
///
/// The mailstore assigns id, status, and retry bookkeeping; publishers only
/// describe what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type, upper-case by convention.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Identity of the publisher.
    pub origin_id: String,

    /// Opaque JSON payload.
    #[serde(default = "empty_object")]
    pub payload: Value,

    /// Routing target.
    #[serde(default)]
    pub target_agent: Option<String>,

    /// Correlation id for request/response pairs.
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Optional justification.
    #[serde(default)]
    pub justification: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NewEvent {
    /// Create an event with an empty payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, origin_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            origin_id: origin_id.into(),
            payload: empty_object(),
            target_agent: None,
            correlation_id: None,
            justification: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Route to a specific agent.
    #[must_use]
    pub fn with_target(mut self, target_agent: impl Into<String>) -> Self {
        self.target_agent = Some(target_agent.into());
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a justification.
    #[must_use]
    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    /// Fill routing and correlation fields from payload keys when the caller
    /// left them unset, and mirror them back into the payload so consumers
    /// that only see the payload observe the same values.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if !self.payload.is_object() {
            self.payload = empty_object();
        }

        if self.target_agent.as_deref().map_or(true, str::is_empty) {
            self.target_agent = non_empty_str(self.payload.get("target_agent"));
        }
        if self.correlation_id.as_deref().map_or(true, str::is_empty) {
            self.correlation_id = non_empty_str(self.payload.get("correlation_id"));
        }
        if self.justification.as_deref().map_or(true, str::is_empty) {
            self.justification = non_empty_str(self.payload.get("justification"));
        }

        let map = self
            .payload
            .as_object_mut()
            .expect("payload coerced to object above");
        if let Some(target) = &self.target_agent {
            map.entry("target_agent".to_string())
                .or_insert_with(|| Value::String(target.clone()));
        }
        if let Some(corr) = &self.correlation_id {
            map.entry("correlation_id".to_string())
                .or_insert_with(|| Value::String(corr.clone()));
        }

        self
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_round_trips_sql_text() {
        for status in [
            EventStatus::Pending,
            EventStatus::Claimed,
            EventStatus::Done,
            EventStatus::Failed,
            EventStatus::Dead,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("pending"), Some(EventStatus::Pending));
        assert_eq!(EventStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(EventStatus::Done.is_terminal());
        assert!(EventStatus::Dead.is_terminal());
        assert!(!EventStatus::Failed.is_terminal());
    }

    #[test]
    fn normalize_pulls_routing_from_payload() {
        let event = NewEvent::new("TOOL_REQUEST", "command")
            .with_payload(json!({
                "target_agent": "forge",
                "correlation_id": "corr-1",
            }))
            .normalized();

        assert_eq!(event.target_agent.as_deref(), Some("forge"));
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn normalize_mirrors_routing_into_payload() {
        let event = NewEvent::new("SUPERVISOR_HEARTBEAT", "supervisor")
            .with_target("recon")
            .with_correlation("hb:recon:1")
            .normalized();

        assert_eq!(event.payload["target_agent"], json!("recon"));
        assert_eq!(event.payload["correlation_id"], json!("hb:recon:1"));
    }

    #[test]
    fn worker_id_prefers_payload_agent() {
        let event = Event {
            id: 7,
            ts: iso_now(),
            event_type: "WORKER_STARTED".to_string(),
            origin_id: "supervisor".to_string(),
            target_agent: Some("command".to_string()),
            payload: json!({"agent_id": "Recon"}),
            justification: None,
            status: EventStatus::Pending,
            error: None,
            correlation_id: None,
            retry_count: 0,
        };
        assert_eq!(event.worker_id().as_deref(), Some("recon"));
    }
}
