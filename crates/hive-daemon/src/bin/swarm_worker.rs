//! `swarm-worker` - per-agent worker subprocess.
//!
//! Claims events routed to its agent inside the shared mailstore, routes
//! every external side effect through the tool gateway, and acknowledges
//! outcomes. Heartbeats are recorded on a monotonic cadence so the
//! supervisor can tell a stuck worker from a busy one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive_core::policy::ToolPolicy;
use hive_daemon::gateway::ToolGateway;
use hive_daemon::logging;
use hive_daemon::mailstore::{MailStore, MailStoreConfig};
use hive_daemon::worker::{run_worker, WorkerLoopConfig, WorkerRuntime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Hive substrate worker process.
#[derive(Parser, Debug)]
#[command(name = "swarm-worker", version, about)]
struct Args {
    /// Mailstore database path.
    #[arg(long)]
    db_path: PathBuf,

    /// Agent id this worker serves.
    #[arg(long)]
    agent_id: String,

    /// Isolated workspace for this worker.
    #[arg(long)]
    worktree: PathBuf,

    /// Consumer identity used for leases.
    #[arg(long)]
    consumer_id: String,

    /// Runtime JSONL log path.
    #[arg(long)]
    log_path: PathBuf,

    /// Lease window requested per claim, in seconds.
    #[arg(long, default_value_t = 15.0)]
    lease_seconds: f64,

    /// Sleep between empty claim attempts, in milliseconds.
    #[arg(long, default_value_t = 200)]
    claim_poll_ms: u64,

    /// Heartbeat cadence in seconds.
    #[arg(long, default_value_t = 1.0)]
    heartbeat_interval_seconds: f64,

    /// Claim unrouted events too.
    #[arg(long)]
    include_unrouted: bool,

    /// Agent id holding the Chief-authorization capability.
    #[arg(long, default_value = "command")]
    chief_agent_id: String,

    /// Wall-clock budget for gateway commands, in seconds.
    #[arg(long, default_value_t = 120.0)]
    command_timeout_seconds: f64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(Some(&args.log_path), &args.log_level)?;

    let mail_store = MailStore::open(
        &args.db_path,
        MailStoreConfig {
            lease_seconds: args.lease_seconds,
            ..MailStoreConfig::default()
        },
    )
    .context("open mailstore")?;

    let worktree = args
        .worktree
        .canonicalize()
        .with_context(|| format!("resolve worktree {}", args.worktree.display()))?;

    let gateway = ToolGateway::new(
        mail_store.clone(),
        ToolPolicy::new(args.chief_agent_id.clone()),
        HashMap::from([(args.agent_id.clone(), worktree)]),
        Duration::from_secs_f64(args.command_timeout_seconds),
    );
    let runtime = WorkerRuntime::new(
        args.agent_id.clone(),
        mail_store.clone(),
        Some(gateway),
        Some(args.log_path.with_extension("runtime.jsonl")),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            let mut int =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("install SIGINT handler");
            tokio::select! {
                _ = term.recv() => {},
                _ = int.recv() => {},
            }
            cancel.cancel();
        });
    }

    info!(
        agent_id = %args.agent_id,
        consumer_id = %args.consumer_id,
        pid = std::process::id(),
        "worker starting"
    );
    run_worker(
        mail_store,
        runtime,
        WorkerLoopConfig {
            agent_id: args.agent_id,
            consumer_id: args.consumer_id,
            lease_seconds: args.lease_seconds,
            claim_poll: Duration::from_millis(args.claim_poll_ms),
            heartbeat_interval: Duration::from_secs_f64(args.heartbeat_interval_seconds),
            include_unrouted: args.include_unrouted,
        },
        cancel,
    )
    .await
    .context("worker loop failed")?;
    Ok(())
}
