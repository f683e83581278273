//! Mechanical admission checks for tool execution requests.
//!
//! The policy is deliberately dumb: every rule is a cheap, deterministic
//! check on the request itself plus filesystem path resolution. Anything
//! requiring judgement (what a command does, what a file means) is out of
//! scope; the gateway only asks "is this request shaped like something the
//! caller is allowed to do, inside the caller's own workspace?".

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::tool::{ToolAction, ToolRequest};

/// Characters that would hand control to a shell if they slipped into an
/// argv entry.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '>', '<', '`', '$'];

/// Outcome of a policy check.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    /// Whether the request passed every check.
    pub allowed: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// The request payload with paths and argv normalized; only meaningful
    /// when `allowed`.
    pub normalized_payload: Value,
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            normalized_payload: Value::Object(Map::new()),
        }
    }

    fn allow(reason: impl Into<String>, normalized_payload: Value) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            normalized_payload,
        }
    }
}

/// Mechanical policy checks for tool execution requests.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    chief_agent_id: String,
    allowed_command_prefixes: Vec<Vec<String>>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new("command")
    }
}

impl ToolPolicy {
    /// Command prefixes admitted by default. Everything else is denied.
    #[must_use]
    pub fn default_command_prefixes() -> Vec<Vec<String>> {
        [
            &["git", "status"][..],
            &["git", "diff"],
            &["git", "add"],
            &["git", "commit"],
            &["git", "apply"],
            &["git", "format-patch"],
            &["git", "rev-parse"],
            &["cargo", "test"],
            &["cargo", "check"],
            &["cargo", "fmt"],
            &["echo"],
        ]
        .iter()
        .map(|prefix| prefix.iter().map(ToString::to_string).collect())
        .collect()
    }

    /// Create a policy with the default command allowlist.
    #[must_use]
    pub fn new(chief_agent_id: impl Into<String>) -> Self {
        Self {
            chief_agent_id: chief_agent_id.into(),
            allowed_command_prefixes: Self::default_command_prefixes(),
        }
    }

    /// Replace the command allowlist.
    #[must_use]
    pub fn with_command_prefixes(mut self, prefixes: Vec<Vec<String>>) -> Self {
        self.allowed_command_prefixes = prefixes;
        self
    }

    /// The agent id holding the Chief-authorization capability.
    #[must_use]
    pub fn chief_agent_id(&self) -> &str {
        &self.chief_agent_id
    }

    /// Validate a request against a worktree root.
    ///
    /// Returns a denial the moment any rule fails; an allowed decision
    /// carries the normalized payload the executor must use.
    #[must_use]
    pub fn validate(&self, request: &ToolRequest, worktree_root: &Path) -> PolicyDecision {
        let Ok(root) = worktree_root.canonicalize() else {
            return PolicyDecision::deny("Worktree root does not exist.");
        };

        let working_dir = Path::new(&request.working_dir);
        match working_dir.canonicalize() {
            Ok(resolved) if resolved.starts_with(&root) => {
                if !resolved.is_dir() {
                    return PolicyDecision::deny("working_dir must exist and be a directory.");
                }
            },
            Ok(_) => return PolicyDecision::deny("working_dir must be inside agent worktree."),
            Err(_) => return PolicyDecision::deny("working_dir must exist and be a directory."),
        }

        if request.action.is_mutating()
            && request.agent_id != self.chief_agent_id
            && request.authorized_by.as_deref() != Some(self.chief_agent_id.as_str())
        {
            return PolicyDecision::deny("Mutating external actions require Chief authorization.");
        }

        let payload = request
            .payload
            .as_object()
            .cloned()
            .unwrap_or_default();

        match request.action {
            ToolAction::RunCmd => self.validate_command_payload(payload),
            ToolAction::WriteFile | ToolAction::ReadFile => {
                Self::validate_file_payload(payload, &root)
            },
            ToolAction::GitCommit => Self::validate_commit_payload(payload, &root),
            ToolAction::GitDiff => Self::validate_diff_payload(payload),
            ToolAction::OpenPr => Self::allow_as_is(payload, "OPEN_PR policy checks passed."),
        }
    }

    fn allow_as_is(payload: Map<String, Value>, reason: &str) -> PolicyDecision {
        PolicyDecision::allow(reason, Value::Object(payload))
    }

    fn validate_command_payload(&self, mut payload: Map<String, Value>) -> PolicyDecision {
        let argv = match payload.get("argv") {
            Some(Value::Array(items)) => {
                let mut argv = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str().map(str::trim) {
                        Some(arg) if !arg.is_empty() => argv.push(arg.to_string()),
                        _ => {
                            return PolicyDecision::deny(
                                "RUN_CMD argv entries must be non-empty strings.",
                            )
                        },
                    }
                }
                argv
            },
            Some(_) => {
                return PolicyDecision::deny("RUN_CMD payload.argv must be a non-empty list.")
            },
            None => match payload.get("command").and_then(Value::as_str) {
                Some(command) if !command.trim().is_empty() => {
                    if command.contains(['"', '\'']) {
                        return PolicyDecision::deny(
                            "RUN_CMD payload.command could not be parsed safely.",
                        );
                    }
                    command.split_whitespace().map(str::to_string).collect()
                },
                _ => {
                    return PolicyDecision::deny(
                        "RUN_CMD requires payload.argv or payload.command.",
                    )
                },
            },
        };

        if argv.is_empty() {
            return PolicyDecision::deny("RUN_CMD payload.argv must be a non-empty list.");
        }

        for arg in &argv {
            if arg.contains(SHELL_METACHARACTERS) {
                return PolicyDecision::deny(format!(
                    "RUN_CMD denied due to shell metacharacters in argument: {arg}"
                ));
            }
        }

        if !self.command_is_allowlisted(&argv) {
            return PolicyDecision::deny(format!(
                "RUN_CMD denied: command not in allowlist ({}).",
                argv[0]
            ));
        }

        payload.insert(
            "argv".to_string(),
            Value::Array(argv.into_iter().map(Value::String).collect()),
        );
        PolicyDecision::allow(
            "RUN_CMD command policy checks passed.",
            Value::Object(payload),
        )
    }

    fn validate_file_payload(mut payload: Map<String, Value>, root: &Path) -> PolicyDecision {
        let Some(path_value) = payload
            .get("path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
        else {
            return PolicyDecision::deny("File actions require a non-empty payload.path.");
        };

        let Some(resolved) = resolve_within(root, path_value) else {
            return PolicyDecision::deny("File path escapes worktree root.");
        };

        payload.insert(
            "path".to_string(),
            Value::String(resolved.to_string_lossy().into_owned()),
        );
        PolicyDecision::allow("File path policy checks passed.", Value::Object(payload))
    }

    fn validate_commit_payload(mut payload: Map<String, Value>, root: &Path) -> PolicyDecision {
        match payload.get("message").and_then(Value::as_str) {
            Some(message) if !message.trim().is_empty() => {},
            _ => return PolicyDecision::deny("GIT_COMMIT requires a non-empty commit message."),
        }

        let paths = match payload.get("paths") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                let mut normalized = Vec::with_capacity(items.len());
                for item in items {
                    let Some(raw) = item.as_str().map(str::trim).filter(|p| !p.is_empty()) else {
                        return PolicyDecision::deny(
                            "GIT_COMMIT paths entries must be non-empty strings.",
                        );
                    };
                    let Some(resolved) = resolve_within(root, raw) else {
                        return PolicyDecision::deny(format!(
                            "GIT_COMMIT path escapes worktree root: {raw}"
                        ));
                    };
                    normalized.push(Value::String(resolved.to_string_lossy().into_owned()));
                }
                normalized
            },
            Some(_) => return PolicyDecision::deny("GIT_COMMIT payload.paths must be a list."),
        };

        payload.insert("paths".to_string(), Value::Array(paths));
        PolicyDecision::allow("GIT_COMMIT policy checks passed.", Value::Object(payload))
    }

    fn validate_diff_payload(mut payload: Map<String, Value>) -> PolicyDecision {
        let args = match payload.get("args") {
            Some(Value::Array(items)) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(arg) if !arg.contains(SHELL_METACHARACTERS) => {
                            args.push(Value::String(arg.to_string()));
                        },
                        _ => return PolicyDecision::deny("GIT_DIFF args must be plain strings."),
                    }
                }
                args
            },
            _ => Vec::new(),
        };
        payload.insert("args".to_string(), Value::Array(args));
        PolicyDecision::allow("GIT_DIFF policy checks passed.", Value::Object(payload))
    }

    fn command_is_allowlisted(&self, argv: &[String]) -> bool {
        self.allowed_command_prefixes.iter().any(|prefix| {
            argv.len() >= prefix.len() && argv[..prefix.len()] == prefix[..]
        })
    }
}

/// Resolve `requested` against `root` and return the absolute path only if
/// it stays inside `root`.
///
/// Symlinks in the existing portion of the path are resolved via
/// `canonicalize`; the not-yet-existing tail may not contain `..` or be
/// anything but plain components. `root` must already be canonical.
#[must_use]
pub fn resolve_within(root: &Path, requested: &str) -> Option<PathBuf> {
    let requested_path = Path::new(requested);
    let joined = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        root.join(requested_path)
    };

    let resolved = resolve_existing_prefix(&joined)?;
    if resolved.starts_with(root) {
        Some(resolved)
    } else {
        None
    }
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// remaining (not yet created) components, refusing `..` in that tail.
fn resolve_existing_prefix(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        if current.exists() {
            let mut resolved = current.canonicalize().ok()?;
            for component in tail.iter().rev() {
                resolved.push(component);
            }
            return Some(resolved);
        }
        // `file_name()` is None when the path ends in `..` or `/`, which
        // rejects parent-dir hops through not-yet-existing directories.
        let name = current.file_name()?.to_os_string();
        tail.push(name);
        current = current.parent()?.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn request(action: ToolAction, agent: &str, dir: &Path, payload: Value) -> ToolRequest {
        ToolRequest {
            agent_id: agent.to_string(),
            action,
            working_dir: dir.to_string_lossy().into_owned(),
            payload,
            authorized_by: None,
            correlation_id: None,
        }
    }

    #[test]
    fn working_dir_outside_root_denied() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let req = request(
            ToolAction::ReadFile,
            "recon",
            elsewhere.path(),
            json!({"path": "notes.txt"}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "working_dir must be inside agent worktree.");
    }

    #[test]
    fn mutating_action_requires_chief() {
        let root = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let req = request(
            ToolAction::WriteFile,
            "recon",
            root.path(),
            json!({"path": "out.txt", "content": "x"}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason,
            "Mutating external actions require Chief authorization."
        );

        let authorized = ToolRequest {
            authorized_by: Some("command".to_string()),
            ..req
        };
        assert!(policy.validate(&authorized, root.path()).allowed);
    }

    #[test]
    fn path_escape_denied() {
        let root = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let req = request(
            ToolAction::WriteFile,
            "command",
            root.path(),
            json!({"path": "../../etc/passwd", "content": "x"}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "File path escapes worktree root.");
    }

    #[test]
    fn symlink_escape_denied() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = root.path().join("leak");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let policy = ToolPolicy::default();
        let req = request(
            ToolAction::WriteFile,
            "command",
            root.path(),
            json!({"path": "leak/secret.txt", "content": "x"}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "File path escapes worktree root.");
    }

    #[test]
    fn new_file_inside_root_allowed() {
        let root = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let req = request(
            ToolAction::WriteFile,
            "command",
            root.path(),
            json!({"path": "sub/dir/out.txt", "content": "x"}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(decision.allowed, "{}", decision.reason);
        let normalized = decision.normalized_payload["path"].as_str().unwrap();
        assert!(Path::new(normalized).starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn shell_metacharacters_denied() {
        let root = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let req = request(
            ToolAction::RunCmd,
            "command",
            root.path(),
            json!({"argv": ["git", "status", ";rm -rf /"]}),
        );
        let decision = policy.validate(&req, root.path());
        assert!(!decision.allowed);
        assert!(decision.reason.contains("shell metacharacters"));
    }

    #[test]
    fn command_allowlist_enforced() {
        let root = TempDir::new().unwrap();
        let policy = ToolPolicy::default();

        let denied = request(
            ToolAction::RunCmd,
            "command",
            root.path(),
            json!({"argv": ["curl", "http://example.com"]}),
        );
        let decision = policy.validate(&denied, root.path());
        assert!(!decision.allowed);
        assert!(decision.reason.contains("not in allowlist"));

        let allowed = request(
            ToolAction::RunCmd,
            "command",
            root.path(),
            json!({"argv": ["git", "status"]}),
        );
        assert!(policy.validate(&allowed, root.path()).allowed);
    }
}
