//! Tool-gateway enforcement tests: idempotency, worktree containment,
//! Chief authorization, allowlisting, and the audit trail.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use hive_core::policy::ToolPolicy;
use hive_core::tool::{ToolAction, ToolRequest};
use hive_daemon::gateway::ToolGateway;
use hive_daemon::mailstore::{MailStore, MailStoreConfig};
use hive_daemon::workspace::WorkspaceManager;
use serde_json::{json, Value};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    store: MailStore,
    gateway: ToolGateway,
    workspace: std::path::PathBuf,
}

fn fixture(agent_id: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = MailStore::open(dir.path().join("mail.db"), MailStoreConfig::default()).unwrap();
    let manager = WorkspaceManager::new(dir.path().join("workspaces")).unwrap();
    let workspace = manager.ensure(agent_id).unwrap();
    let gateway = ToolGateway::new(
        store.clone(),
        ToolPolicy::new("command"),
        HashMap::from([(agent_id.to_string(), workspace.clone())]),
        Duration::from_secs(10),
    );
    Fixture {
        _dir: dir,
        store,
        gateway,
        workspace,
    }
}

fn request(
    agent: &str,
    action: ToolAction,
    working_dir: &Path,
    payload: Value,
    authorized_by: Option<&str>,
) -> ToolRequest {
    ToolRequest {
        agent_id: agent.to_string(),
        action,
        working_dir: working_dir.to_string_lossy().into_owned(),
        payload,
        authorized_by: authorized_by.map(str::to_string),
        correlation_id: Some("corr-test".to_string()),
    }
}

#[tokio::test]
async fn run_cmd_allowed_then_duplicate_key_blocked() {
    let f = fixture("command");

    let first = f
        .gateway
        .execute(request(
            "command",
            ToolAction::RunCmd,
            &f.workspace,
            json!({"argv": ["echo", "hello"], "idempotency_key": "k1"}),
            None,
        ))
        .await
        .unwrap();
    assert!(first.allowed, "{:?}", first.reason);
    assert_eq!(first.return_code, Some(0));
    assert_eq!(first.stdout.trim(), "hello");
    assert!(first.audit_id.is_some());

    let replay = f
        .gateway
        .execute(request(
            "command",
            ToolAction::RunCmd,
            &f.workspace,
            json!({"argv": ["echo", "hello"], "idempotency_key": "k1"}),
            None,
        ))
        .await
        .unwrap();
    assert!(!replay.allowed);
    assert!(
        replay
            .reason
            .as_deref()
            .unwrap()
            .contains("Duplicate idempotency_key blocked: k1"),
        "unexpected reason: {:?}",
        replay.reason
    );

    // One allowed and one denied audit row, in order.
    let audits = f.store.list_tool_audit(0, 10).unwrap();
    assert_eq!(audits.len(), 2);
    assert!(audits[0].allowed);
    assert!(!audits[1].allowed);
    assert_eq!(audits[0].idempotency_key.as_deref(), Some("k1"));

    // At most one non-denied audit entry per key.
    let allowed_for_key = audits
        .iter()
        .filter(|a| a.idempotency_key.as_deref() == Some("k1") && a.allowed)
        .count();
    assert_eq!(allowed_for_key, 1);
}

#[tokio::test]
async fn worktree_escape_denied() {
    let f = fixture("recon");

    let result = f
        .gateway
        .execute(request(
            "recon",
            ToolAction::WriteFile,
            &f.workspace,
            json!({
                "path": "../../etc/passwd",
                "content": "oops",
                "idempotency_key": "escape-1",
            }),
            Some("command"),
        ))
        .await
        .unwrap();

    assert!(!result.allowed);
    assert_eq!(result.reason.as_deref(), Some("File path escapes worktree root."));
    assert!(!Path::new("/etc/passwd.oops").exists());

    // The denial did not consume the key: a corrected request may reuse it.
    assert!(f.store.get_idempotency_record("escape-1").unwrap().is_none());
}

#[tokio::test]
async fn mutating_action_requires_chief_authorization() {
    let f = fixture("recon");

    let denied = f
        .gateway
        .execute(request(
            "recon",
            ToolAction::WriteFile,
            &f.workspace,
            json!({"path": "out.txt", "content": "x", "idempotency_key": "w1"}),
            None,
        ))
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(
        denied.reason.as_deref(),
        Some("Mutating external actions require Chief authorization.")
    );

    let allowed = f
        .gateway
        .execute(request(
            "recon",
            ToolAction::WriteFile,
            &f.workspace,
            json!({"path": "out.txt", "content": "hello", "idempotency_key": "w2"}),
            Some("command"),
        ))
        .await
        .unwrap();
    assert!(allowed.allowed, "{:?}", allowed.reason);
    assert_eq!(
        std::fs::read_to_string(f.workspace.join("out.txt")).unwrap(),
        "hello"
    );
}

#[tokio::test]
async fn missing_idempotency_key_denied() {
    let f = fixture("command");

    let result = f
        .gateway
        .execute(request(
            "command",
            ToolAction::RunCmd,
            &f.workspace,
            json!({"argv": ["echo", "hi"]}),
            None,
        ))
        .await
        .unwrap();
    assert!(!result.allowed);
    assert_eq!(
        result.reason.as_deref(),
        Some("Missing required payload.idempotency_key.")
    );
}

#[tokio::test]
async fn command_allowlist_and_metacharacters_enforced() {
    let f = fixture("command");

    let unlisted = f
        .gateway
        .execute(request(
            "command",
            ToolAction::RunCmd,
            &f.workspace,
            json!({"argv": ["curl", "http://example.com"], "idempotency_key": "c1"}),
            None,
        ))
        .await
        .unwrap();
    assert!(!unlisted.allowed);
    assert!(unlisted.reason.as_deref().unwrap().contains("not in allowlist"));

    let metachars = f
        .gateway
        .execute(request(
            "command",
            ToolAction::RunCmd,
            &f.workspace,
            json!({"argv": ["echo", "x;rm"], "idempotency_key": "c2"}),
            None,
        ))
        .await
        .unwrap();
    assert!(!metachars.allowed);
    assert!(metachars
        .reason
        .as_deref()
        .unwrap()
        .contains("shell metacharacters"));
}

#[tokio::test]
async fn unknown_action_kind_denied_with_audit() {
    let f = fixture("command");

    let audit_id = f
        .gateway
        .deny_unrecognized("command", "LAUNCH_MISSILES", "/tmp", None)
        .unwrap();

    let audits = f.store.list_tool_audit(0, 10).unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].id, audit_id);
    assert!(!audits[0].allowed);
    assert_eq!(audits[0].action_type, "LAUNCH_MISSILES");
    assert!(audits[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("Unsupported action type"));
}

#[tokio::test]
async fn read_file_round_trip_and_missing_target() {
    let f = fixture("recon");
    std::fs::write(f.workspace.join("notes.txt"), "field report").unwrap();

    let read = f
        .gateway
        .execute(request(
            "recon",
            ToolAction::ReadFile,
            &f.workspace,
            json!({"path": "notes.txt", "idempotency_key": "r1"}),
            None,
        ))
        .await
        .unwrap();
    assert!(read.allowed);
    assert_eq!(read.stdout, "field report");
    assert_eq!(read.return_code, Some(0));

    let missing = f
        .gateway
        .execute(request(
            "recon",
            ToolAction::ReadFile,
            &f.workspace,
            json!({"path": "ghost.txt", "idempotency_key": "r2"}),
            None,
        ))
        .await
        .unwrap();
    assert!(missing.allowed);
    assert_eq!(missing.return_code, Some(1));
    assert!(missing.stderr.contains("does not exist"));
}

#[tokio::test]
async fn every_decision_appends_exactly_one_audit_row() {
    let f = fixture("command");

    for key in ["a1", "a1", "a2"] {
        let _ = f
            .gateway
            .execute(request(
                "command",
                ToolAction::RunCmd,
                &f.workspace,
                json!({"argv": ["echo", "x"], "idempotency_key": key}),
                None,
            ))
            .await
            .unwrap();
    }

    let audits = f.store.list_tool_audit(0, 10).unwrap();
    assert_eq!(audits.len(), 3);
    let ids: Vec<i64> = audits.iter().map(|a| a.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "audit ids ascend");
    let allowed = audits.iter().filter(|a| a.allowed).count();
    let denied = audits.iter().filter(|a| !a.allowed).count();
    assert_eq!((allowed, denied), (2, 1));
}
