//! Tool action model: requests, results, and the audit trail records.
//!
//! Every externally visible action a worker attempts is expressed as a
//! [`ToolRequest`] and adjudicated by the gateway; the outcome of each
//! decision is one append-only [`AuditEntry`] row.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of tool actions the gateway understands.
///
/// Anything that does not parse into this enum is denied outright; the
/// gateway never ignores an unknown action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolAction {
    /// Execute an allowlisted command inside the workspace.
    RunCmd,
    /// Write a file inside the workspace.
    WriteFile,
    /// Read a file inside the workspace.
    ReadFile,
    /// Stage and commit files inside the workspace.
    GitCommit,
    /// Produce a diff of the workspace.
    GitDiff,
    /// Open a pull request (declared but not executed by this substrate).
    OpenPr,
}

impl ToolAction {
    /// The wire/SQL form of this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunCmd => "RUN_CMD",
            Self::WriteFile => "WRITE_FILE",
            Self::ReadFile => "READ_FILE",
            Self::GitCommit => "GIT_COMMIT",
            Self::GitDiff => "GIT_DIFF",
            Self::OpenPr => "OPEN_PR",
        }
    }

    /// Actions that mutate externally visible state and therefore require
    /// Chief authorization.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::RunCmd | Self::WriteFile | Self::GitCommit | Self::OpenPr
        )
    }
}

impl std::fmt::Display for ToolAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolAction {
    type Err = UnknownToolAction;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUN_CMD" => Ok(Self::RunCmd),
            "WRITE_FILE" => Ok(Self::WriteFile),
            "READ_FILE" => Ok(Self::ReadFile),
            "GIT_COMMIT" => Ok(Self::GitCommit),
            "GIT_DIFF" => Ok(Self::GitDiff),
            "OPEN_PR" => Ok(Self::OpenPr),
            _ => Err(UnknownToolAction {
                action: raw.to_string(),
            }),
        }
    }
}

/// Parse error for tool action kinds.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown tool action: {action}")]
pub struct UnknownToolAction {
    /// The unrecognized action string.
    pub action: String,
}

/// A request to perform an externally visible action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// The agent issuing the request.
    pub agent_id: String,

    /// What kind of action is requested.
    pub action: ToolAction,

    /// Directory the action runs in; must lie inside the agent's workspace.
    pub working_dir: String,

    /// Action parameters, including the mandatory `idempotency_key`.
    #[serde(default)]
    pub payload: Value,

    /// Agent that authorized a mutating action on the caller's behalf.
    #[serde(default)]
    pub authorized_by: Option<String>,

    /// Correlation id threaded through to the audit row.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ToolRequest {
    /// The `idempotency_key` from the payload, trimmed, if present and
    /// non-empty.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<String> {
        self.payload
            .get("idempotency_key")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

/// Outcome of a gateway decision plus, for allowed actions, the execution
/// result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the action was admitted and executed.
    pub allowed: bool,

    /// The action kind that was adjudicated.
    pub action: ToolAction,

    /// The requesting agent.
    pub agent_id: String,

    /// The working directory the request named.
    pub working_dir: String,

    /// Captured standard output (allowed actions).
    #[serde(default)]
    pub stdout: String,

    /// Captured standard error (allowed actions).
    #[serde(default)]
    pub stderr: String,

    /// Exit code of the executed action, when one exists.
    #[serde(default)]
    pub return_code: Option<i32>,

    /// Failure description, when the action was denied or errored.
    #[serde(default)]
    pub error: Option<String>,

    /// Human-readable decision reason.
    #[serde(default)]
    pub reason: Option<String>,

    /// Id of the audit row recording this decision.
    #[serde(default)]
    pub audit_id: Option<i64>,

    /// Correlation id echoed from the request.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// A stored tool-audit row. Append-only; ids are strictly monotonic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Monotonically increasing audit id.
    pub id: i64,

    /// RFC 3339 timestamp (informational).
    pub ts: String,

    /// The requesting agent.
    pub agent_id: String,

    /// The action kind as stored (kept as text so unknown kinds that were
    /// denied still round-trip).
    pub action_type: String,

    /// The working directory the request named.
    pub working_dir: String,

    /// The idempotency key the request carried, if any.
    pub idempotency_key: Option<String>,

    /// The admission decision.
    pub allowed: bool,

    /// Decision reason.
    pub reason: Option<String>,

    /// The (normalized) request payload.
    pub payload: Value,

    /// Execution outcome for allowed actions.
    pub result: Option<Value>,

    /// Correlation id from the request.
    pub correlation_id: Option<String>,
}

/// Parameters for appending a tool-audit row.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// The requesting agent.
    pub agent_id: String,
    /// The action kind as text.
    pub action_type: String,
    /// The working directory the request named.
    pub working_dir: String,
    /// The idempotency key the request carried, if any.
    pub idempotency_key: Option<String>,
    /// The admission decision.
    pub allowed: bool,
    /// Decision reason.
    pub reason: Option<String>,
    /// The (normalized) request payload.
    pub payload: Value,
    /// Execution outcome for allowed actions.
    pub result: Option<Value>,
    /// Correlation id from the request.
    pub correlation_id: Option<String>,
}

/// A stored idempotency record. The primary key guarantees at-most-once
/// effect per key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    /// The caller-supplied key.
    pub idempotency_key: String,
    /// RFC 3339 reservation timestamp.
    pub created_ts: String,
    /// Agent that reserved the key.
    pub agent_id: String,
    /// Action kind the key was reserved for.
    pub action_type: String,
    /// Event that triggered the action, if known.
    pub event_id: Option<i64>,
    /// Cached execution result.
    pub result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn action_parse_round_trip() {
        for action in [
            ToolAction::RunCmd,
            ToolAction::WriteFile,
            ToolAction::ReadFile,
            ToolAction::GitCommit,
            ToolAction::GitDiff,
            ToolAction::OpenPr,
        ] {
            assert_eq!(action.as_str().parse::<ToolAction>().unwrap(), action);
        }
        assert!("LAUNCH_MISSILES".parse::<ToolAction>().is_err());
    }

    #[test]
    fn mutating_actions() {
        assert!(ToolAction::RunCmd.is_mutating());
        assert!(ToolAction::WriteFile.is_mutating());
        assert!(ToolAction::GitCommit.is_mutating());
        assert!(ToolAction::OpenPr.is_mutating());
        assert!(!ToolAction::ReadFile.is_mutating());
        assert!(!ToolAction::GitDiff.is_mutating());
    }

    #[test]
    fn idempotency_key_extraction() {
        let request = ToolRequest {
            agent_id: "forge".to_string(),
            action: ToolAction::RunCmd,
            working_dir: "/tmp".to_string(),
            payload: json!({"idempotency_key": "  k1  "}),
            authorized_by: None,
            correlation_id: None,
        };
        assert_eq!(request.idempotency_key().as_deref(), Some("k1"));

        let blank = ToolRequest {
            payload: json!({"idempotency_key": "   "}),
            ..request
        };
        assert_eq!(blank.idempotency_key(), None);
    }
}
