//! Policy-gated execution of tool actions.
//!
//! Every externally visible action a worker attempts flows through
//! [`ToolGateway::execute`]. The gateway admits or denies per
//! [`hive_core::policy::ToolPolicy`], enforces at-most-once effect per
//! idempotency key, executes admitted actions, and appends exactly one
//! audit row per decision. Unknown action kinds are denied, never ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use hive_core::policy::{PolicyDecision, ToolPolicy};
use hive_core::tool::{NewAuditEntry, ToolAction, ToolRequest, ToolResult};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::mailstore::{MailStore, MailStoreError};

/// Errors from the gateway itself. Policy denials are not errors; they are
/// `allowed = false` results.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The mailstore failed while recording the decision.
    #[error(transparent)]
    Store(#[from] MailStoreError),
}

/// Single execution gateway for all external tool actions.
#[derive(Debug, Clone)]
pub struct ToolGateway {
    mail_store: MailStore,
    policy: ToolPolicy,
    workspace_roots: HashMap<String, PathBuf>,
    command_timeout: Duration,
}

impl ToolGateway {
    /// Create a gateway over the given store and policy.
    #[must_use]
    pub fn new(
        mail_store: MailStore,
        policy: ToolPolicy,
        workspace_roots: HashMap<String, PathBuf>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            mail_store,
            policy,
            workspace_roots,
            command_timeout: command_timeout.max(Duration::from_secs(1)),
        }
    }

    /// Register or replace the workspace root for an agent.
    pub fn set_workspace_root(&mut self, agent_id: impl Into<String>, root: PathBuf) {
        self.workspace_roots.insert(agent_id.into(), root);
    }

    /// Adjudicate and (when admitted) execute one tool request.
    ///
    /// Exactly one audit row is appended per call; its id is returned in
    /// the result. Denials return `allowed = false` with the reason.
    pub async fn execute(&self, request: ToolRequest) -> Result<ToolResult, GatewayError> {
        let Some(idempotency_key) = request.idempotency_key() else {
            return self.deny(
                &request,
                "Missing required payload.idempotency_key.",
                request.payload.clone(),
                None,
                None,
            );
        };

        let Some(workspace_root) = self.workspace_roots.get(&request.agent_id) else {
            let reason = format!(
                "No registered workspace root for agent '{}'.",
                request.agent_id
            );
            return self.deny(
                &request,
                &reason,
                request.payload.clone(),
                Some(&idempotency_key),
                None,
            );
        };

        let decision: PolicyDecision = self.policy.validate(&request, workspace_root);
        if !decision.allowed {
            return self.deny(
                &request,
                &decision.reason,
                request.payload.clone(),
                Some(&idempotency_key),
                None,
            );
        }
        let normalized_payload = decision.normalized_payload;

        if request.action == ToolAction::OpenPr {
            return self.deny(
                &request,
                "OPEN_PR is intentionally not implemented.",
                normalized_payload,
                Some(&idempotency_key),
                None,
            );
        }

        if let Some(existing) = self.mail_store.get_idempotency_record(&idempotency_key)? {
            let reason = format!("Duplicate idempotency_key blocked: {idempotency_key}");
            let duplicate_of = serde_json::to_value(&existing).unwrap_or(Value::Null);
            return self.deny(
                &request,
                &reason,
                normalized_payload,
                Some(&idempotency_key),
                Some(json!({ "duplicate_of": duplicate_of })),
            );
        }
        if !self.mail_store.reserve_idempotency_key(
            &idempotency_key,
            &request.agent_id,
            request.action.as_str(),
            None,
        )? {
            let reason = format!("Duplicate idempotency_key blocked: {idempotency_key}");
            return self.deny(
                &request,
                &reason,
                normalized_payload,
                Some(&idempotency_key),
                None,
            );
        }

        let mut result = match self.execute_allowed(&request, &normalized_payload).await {
            Ok(result) => result,
            Err(error) => ToolResult {
                allowed: false,
                action: request.action,
                agent_id: request.agent_id.clone(),
                working_dir: request.working_dir.clone(),
                stdout: String::new(),
                stderr: String::new(),
                return_code: None,
                error: Some(error.clone()),
                reason: Some(format!("Execution error: {error}")),
                audit_id: None,
                correlation_id: request.correlation_id.clone(),
            },
        };

        let result_payload = json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "return_code": result.return_code,
            "error": result.error,
        });
        let audit_id = self.mail_store.record_tool_audit_with_result(
            &NewAuditEntry {
                agent_id: request.agent_id.clone(),
                action_type: request.action.as_str().to_string(),
                working_dir: request.working_dir.clone(),
                idempotency_key: Some(idempotency_key.clone()),
                allowed: result.allowed,
                reason: result.reason.clone(),
                payload: normalized_payload,
                result: Some(result_payload.clone()),
                correlation_id: request.correlation_id.clone(),
            },
            &idempotency_key,
            &result_payload,
        )?;
        result.audit_id = Some(audit_id);

        if result.allowed {
            info!(
                agent_id = %result.agent_id,
                action = %result.action,
                audit_id,
                "tool action executed"
            );
        } else {
            warn!(
                agent_id = %result.agent_id,
                action = %result.action,
                audit_id,
                reason = result.reason.as_deref().unwrap_or(""),
                "tool action failed during execution"
            );
        }
        Ok(result)
    }

    /// Deny an action kind the gateway does not understand. Strictness
    /// rule: unrecognized kinds are denied and audited, never ignored.
    pub fn deny_unrecognized(
        &self,
        agent_id: &str,
        action_type: &str,
        working_dir: &str,
        correlation_id: Option<String>,
    ) -> Result<i64, GatewayError> {
        let reason = format!("Unsupported action type: {action_type}");
        let audit_id = self.mail_store.record_tool_audit(&NewAuditEntry {
            agent_id: agent_id.to_string(),
            action_type: action_type.to_string(),
            working_dir: working_dir.to_string(),
            idempotency_key: None,
            allowed: false,
            reason: Some(reason),
            payload: json!({}),
            result: None,
            correlation_id,
        })?;
        warn!(agent_id, action_type, audit_id, "unrecognized tool action denied");
        Ok(audit_id)
    }

    fn deny(
        &self,
        request: &ToolRequest,
        reason: &str,
        payload: Value,
        idempotency_key: Option<&str>,
        result: Option<Value>,
    ) -> Result<ToolResult, GatewayError> {
        let audit_id = self.mail_store.record_tool_audit(&NewAuditEntry {
            agent_id: request.agent_id.clone(),
            action_type: request.action.as_str().to_string(),
            working_dir: request.working_dir.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
            allowed: false,
            reason: Some(reason.to_string()),
            payload,
            result,
            correlation_id: request.correlation_id.clone(),
        })?;

        warn!(
            agent_id = %request.agent_id,
            action = %request.action,
            audit_id,
            reason,
            "tool action denied"
        );

        Ok(ToolResult {
            allowed: false,
            action: request.action,
            agent_id: request.agent_id.clone(),
            working_dir: request.working_dir.clone(),
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
            error: Some(reason.to_string()),
            reason: Some(reason.to_string()),
            audit_id: Some(audit_id),
            correlation_id: request.correlation_id.clone(),
        })
    }

    async fn execute_allowed(
        &self,
        request: &ToolRequest,
        payload: &Value,
    ) -> Result<ToolResult, String> {
        match request.action {
            ToolAction::RunCmd => {
                let argv = string_array(payload, "argv")?;
                if argv.is_empty() {
                    return Err("RUN_CMD requires a normalized argv list.".to_string());
                }
                let output = self
                    .run_argv(&argv, Path::new(&request.working_dir))
                    .await?;
                Ok(Self::allowed_result(request, output, "RUN_CMD executed."))
            },
            ToolAction::WriteFile => {
                let path = string_field(payload, "path")?;
                let content = payload
                    .get("content")
                    .map(|c| c.as_str().map_or_else(|| c.to_string(), str::to_string))
                    .unwrap_or_default();
                if let Some(parent) = Path::new(&path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                std::fs::write(&path, &content).map_err(|e| e.to_string())?;
                Ok(Self::allowed_result(
                    request,
                    CommandOutput {
                        stdout: format!("Wrote {} bytes to {path}", content.len()),
                        stderr: String::new(),
                        return_code: Some(0),
                    },
                    "WRITE_FILE executed.",
                ))
            },
            ToolAction::ReadFile => {
                let path = string_field(payload, "path")?;
                if !Path::new(&path).exists() {
                    return Ok(Self::allowed_result(
                        request,
                        CommandOutput {
                            stdout: String::new(),
                            stderr: format!("File does not exist: {path}"),
                            return_code: Some(1),
                        },
                        "READ_FILE target missing.",
                    ));
                }
                let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
                Ok(Self::allowed_result(
                    request,
                    CommandOutput {
                        stdout: content,
                        stderr: String::new(),
                        return_code: Some(0),
                    },
                    "READ_FILE executed.",
                ))
            },
            ToolAction::GitCommit => {
                let message = string_field(payload, "message")?;
                let paths = string_array(payload, "paths").unwrap_or_default();

                let mut add_argv = vec!["git".to_string(), "add".to_string(), "--".to_string()];
                add_argv.extend(paths);
                let add = self
                    .run_argv(&add_argv, Path::new(&request.working_dir))
                    .await?;

                let commit_argv = vec![
                    "git".to_string(),
                    "commit".to_string(),
                    "-m".to_string(),
                    message,
                ];
                let commit = self
                    .run_argv(&commit_argv, Path::new(&request.working_dir))
                    .await?;

                let return_code = match commit.return_code {
                    Some(0) => add.return_code,
                    other => other,
                };
                Ok(Self::allowed_result(
                    request,
                    CommandOutput {
                        stdout: format!("{}{}", add.stdout, commit.stdout),
                        stderr: format!("{}{}", add.stderr, commit.stderr),
                        return_code,
                    },
                    "GIT_COMMIT executed.",
                ))
            },
            ToolAction::GitDiff => {
                let mut argv = vec!["git".to_string(), "diff".to_string()];
                argv.extend(string_array(payload, "args").unwrap_or_default());
                let output = self
                    .run_argv(&argv, Path::new(&request.working_dir))
                    .await?;
                Ok(Self::allowed_result(request, output, "GIT_DIFF executed."))
            },
            ToolAction::OpenPr => Err("OPEN_PR is intentionally not implemented.".to_string()),
        }
    }

    fn allowed_result(request: &ToolRequest, output: CommandOutput, reason: &str) -> ToolResult {
        ToolResult {
            allowed: true,
            action: request.action,
            agent_id: request.agent_id.clone(),
            working_dir: request.working_dir.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            return_code: output.return_code,
            error: None,
            reason: Some(reason.to_string()),
            audit_id: None,
            correlation_id: request.correlation_id.clone(),
        }
    }

    /// Execute argv directly (no shell) with a cleared environment and a
    /// bounded wall-clock budget.
    async fn run_argv(&self, argv: &[String], cwd: &Path) -> Result<CommandOutput, String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty argv".to_string())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("LANG", "C.UTF-8");

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn '{program}': {e}"))?;

        match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                return_code: output.status.code(),
            }),
            Ok(Err(e)) => Err(format!("failed to wait for '{program}': {e}")),
            Err(_) => Err(format!(
                "'{program}' timed out after {}ms",
                self.command_timeout.as_millis()
            )),
        }
    }
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    return_code: Option<i32>,
}

fn string_field(payload: &Value, key: &str) -> Result<String, String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required payload.{key}"))
}

fn string_array(payload: &Value, key: &str) -> Result<Vec<String>, String> {
    match payload.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("payload.{key} entries must be strings"))
            })
            .collect(),
        Some(_) => Err(format!("payload.{key} must be a list")),
    }
}
