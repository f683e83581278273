//! Worker runtime: per-agent event handling and the claim loop.
//!
//! A worker claims events routed to its agent id, processes them, and
//! acknowledges the outcome. Every external side effect goes through the
//! tool gateway. Handler outputs depend only on the event being processed;
//! nothing recorded into events or audits reads a clock, a pid, or any
//! uncontrolled randomness.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use hive_core::event::{iso_now, Event, NewEvent};
use hive_core::tool::{ToolAction, ToolRequest};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gateway::ToolGateway;
use crate::mailstore::{MailStore, MailStoreError};

/// Errors from event handling.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The mailstore failed.
    #[error(transparent)]
    Store(#[from] MailStoreError),

    /// The gateway failed internally (not a policy denial).
    #[error(transparent)]
    Gateway(#[from] crate::gateway::GatewayError),

    /// The event payload was not shaped as the handler requires.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// Per-agent event handler.
#[derive(Debug)]
pub struct WorkerRuntime {
    agent_id: String,
    mail_store: MailStore,
    gateway: Option<ToolGateway>,
    runtime_log_path: Option<PathBuf>,
}

impl WorkerRuntime {
    /// Create a runtime for one agent.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        mail_store: MailStore,
        gateway: Option<ToolGateway>,
        runtime_log_path: Option<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            mail_store,
            gateway,
            runtime_log_path,
        }
    }

    /// The agent this runtime serves.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Process one claimed event and return the handler outcome recorded
    /// into the ack.
    pub async fn handle_event(&self, event: &Event) -> Result<Value, WorkerError> {
        if let Some(target) = event.target_agent.as_deref() {
            if !target.is_empty() && target != self.agent_id {
                return Ok(json!({
                    "status": "skipped",
                    "reason": "target_agent mismatch",
                    "event_id": event.id,
                }));
            }
        }

        let outcome = match event.event_type.as_str() {
            "SUPERVISOR_HEARTBEAT" => json!({
                "status": "heartbeat_seen",
                "event_id": event.id,
            }),
            "TOOL_REQUEST" => self.handle_tool_request(event).await?,
            _ => json!({
                "status": "processed",
                "event_id": event.id,
                "event_type": event.event_type,
                "agent_id": self.agent_id,
            }),
        };

        self.log_runtime(&json!({
            "agent_id": self.agent_id,
            "event_id": event.id,
            "event_type": event.event_type,
            "outcome": outcome,
        }));
        Ok(outcome)
    }

    /// Route an embedded tool request through the gateway and publish the
    /// result as a `TOOL_RESULT` event back to the requester.
    async fn handle_tool_request(&self, event: &Event) -> Result<Value, WorkerError> {
        let Some(gateway) = &self.gateway else {
            return Ok(json!({
                "status": "tool_gateway_missing",
                "event_id": event.id,
            }));
        };

        let Some(request_raw) = event.payload.get("request").and_then(Value::as_object) else {
            return Ok(json!({
                "status": "invalid_request_payload",
                "event_id": event.id,
            }));
        };

        let raw_action = request_raw
            .get("action_type")
            .or_else(|| request_raw.get("action"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let working_dir = request_raw
            .get("working_dir")
            .or_else(|| event.payload.get("working_dir"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let Ok(action) = raw_action.parse::<ToolAction>() else {
            // Strict gateway: unknown action kinds are denied, not ignored.
            let audit_id = gateway.deny_unrecognized(
                &self.agent_id,
                raw_action,
                &working_dir,
                event.correlation_id.clone(),
            )?;
            return Ok(json!({
                "status": "tool_request_denied",
                "event_id": event.id,
                "allowed": false,
                "reason": format!("Unsupported action type: {raw_action}"),
                "audit_id": audit_id,
            }));
        };

        let request = ToolRequest {
            agent_id: request_raw
                .get("agent_id")
                .and_then(Value::as_str)
                .unwrap_or(&self.agent_id)
                .to_string(),
            action,
            working_dir,
            payload: request_raw
                .get("payload")
                .cloned()
                .unwrap_or_else(|| json!({})),
            authorized_by: request_raw
                .get("authorized_by")
                .or_else(|| event.payload.get("authorized_by"))
                .and_then(Value::as_str)
                .map(str::to_string),
            correlation_id: event.correlation_id.clone(),
        };
        let idempotency_key = request.idempotency_key();

        let result = gateway.execute(request).await?;

        let reply_to = event
            .payload
            .get("reply_to")
            .and_then(Value::as_str)
            .unwrap_or("command");
        let mut reply = NewEvent::new("TOOL_RESULT", self.agent_id.clone())
            .with_target(reply_to)
            .with_payload(json!({
                "source_event_id": event.id,
                "allowed": result.allowed,
                "reason": result.reason,
                "return_code": result.return_code,
                "stdout": result.stdout,
                "stderr": result.stderr,
                "audit_id": result.audit_id,
                "idempotency_key": idempotency_key,
            }));
        if let Some(corr) = &event.correlation_id {
            reply = reply.with_correlation(corr.clone());
        }
        self.mail_store.publish(reply)?;

        Ok(json!({
            "status": "tool_request_handled",
            "event_id": event.id,
            "allowed": result.allowed,
            "reason": result.reason,
            "audit_id": result.audit_id,
        }))
    }

    fn log_runtime(&self, record: &Value) {
        let Some(path) = &self.runtime_log_path else {
            return;
        };
        let line = json!({ "ts": iso_now(), "record": record });
        let appended = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
            })
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = appended {
            warn!(path = %path.display(), %err, "failed to append runtime log");
        }
    }
}

/// Configuration for the worker claim loop.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Agent id to claim for.
    pub agent_id: String,
    /// Consumer identity used for leases.
    pub consumer_id: String,
    /// Lease window requested per claim.
    pub lease_seconds: f64,
    /// Sleep between empty claim attempts.
    pub claim_poll: Duration,
    /// Cadence of heartbeat rows (at most half the supervisor's interval).
    pub heartbeat_interval: Duration,
    /// Whether to also claim unrouted events.
    pub include_unrouted: bool,
}

/// Run the worker claim loop until cancelled.
///
/// The loop records a heartbeat row on a monotonic cadence, claims one
/// event at a time, and acks or fails it. On cancellation with a claimed
/// event in hand the event is failed with `retry = true` so the next
/// claimer picks it up. Lease losses are dropped, as the work now belongs
/// to whichever consumer reclaimed it.
pub async fn run_worker(
    mail_store: MailStore,
    runtime: WorkerRuntime,
    config: WorkerLoopConfig,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let pid = std::process::id();
    info!(
        agent_id = %config.agent_id,
        consumer_id = %config.consumer_id,
        pid,
        "worker loop starting"
    );

    let mut next_heartbeat = Instant::now();
    while !cancel.is_cancelled() {
        if Instant::now() >= next_heartbeat {
            mail_store.record_worker_heartbeat(&config.agent_id, &config.consumer_id, pid)?;
            next_heartbeat = Instant::now() + config.heartbeat_interval;
        }

        let claimed = mail_store.try_claim(
            &config.consumer_id,
            Some(&config.agent_id),
            config.include_unrouted,
            Some(config.lease_seconds),
        )?;

        let Some(event) = claimed else {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(config.claim_poll) => {},
            }
            continue;
        };

        if cancel.is_cancelled() {
            // Shutting down with an active lease: hand the event back.
            let _ = mail_store.fail(event.id, &config.consumer_id, "worker cancelled", true);
            break;
        }

        info!(
            agent_id = %config.agent_id,
            event_id = event.id,
            event_type = %event.event_type,
            "claimed event"
        );
        match runtime.handle_event(&event).await {
            Ok(outcome) => {
                match mail_store.ack(event.id, &config.consumer_id, Some(&outcome)) {
                    Ok(()) => info!(event_id = event.id, "acked event"),
                    Err(MailStoreError::LeaseLost { .. }) => {
                        warn!(event_id = event.id, "lease lost before ack; dropping");
                    },
                    Err(err) => return Err(err.into()),
                }
            },
            Err(err) => {
                error!(event_id = event.id, %err, "event handler failed");
                match mail_store.fail(event.id, &config.consumer_id, &err.to_string(), true) {
                    Ok(_) | Err(MailStoreError::LeaseLost { .. }) => {},
                    Err(store_err) => return Err(store_err.into()),
                }
            },
        }
    }

    info!(
        agent_id = %config.agent_id,
        consumer_id = %config.consumer_id,
        "worker loop stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::mailstore::MailStoreConfig;

    fn fixture() -> (TempDir, MailStore, WorkerRuntime) {
        let dir = TempDir::new().unwrap();
        let store = MailStore::open(dir.path().join("mail.db"), MailStoreConfig::default())
            .unwrap();
        let runtime = WorkerRuntime::new("recon", store.clone(), None, None);
        (dir, store, runtime)
    }

    #[tokio::test]
    async fn heartbeat_events_are_acknowledged_without_side_effects() {
        let (_dir, store, runtime) = fixture();
        let id = store
            .publish(NewEvent::new("SUPERVISOR_HEARTBEAT", "supervisor").with_target("recon"))
            .unwrap();
        let event = store
            .try_claim("worker:recon:1", Some("recon"), false, None)
            .unwrap()
            .unwrap();
        assert_eq!(event.id, id);

        let outcome = runtime.handle_event(&event).await.unwrap();
        assert_eq!(outcome["status"], "heartbeat_seen");
    }

    #[tokio::test]
    async fn mistargeted_events_are_skipped() {
        let (_dir, store, runtime) = fixture();
        store
            .publish(NewEvent::new("TASK", "command").with_target("forge"))
            .unwrap();
        let event = store
            .try_claim("worker:any:1", None, true, None)
            .unwrap()
            .unwrap();

        let outcome = runtime.handle_event(&event).await.unwrap();
        assert_eq!(outcome["status"], "skipped");
    }

    #[tokio::test]
    async fn tool_request_without_gateway_reports_missing() {
        let (_dir, store, runtime) = fixture();
        store
            .publish(
                NewEvent::new("TOOL_REQUEST", "command")
                    .with_target("recon")
                    .with_payload(serde_json::json!({"request": {"action_type": "RUN_CMD"}})),
            )
            .unwrap();
        let event = store
            .try_claim("worker:recon:1", Some("recon"), false, None)
            .unwrap()
            .unwrap();

        let outcome = runtime.handle_event(&event).await.unwrap();
        assert_eq!(outcome["status"], "tool_gateway_missing");
    }
}
