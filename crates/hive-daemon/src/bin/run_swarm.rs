//! `run_swarm` - supervisor entry point.
//!
//! Spawns one `swarm-worker` per agent over a durable SQLite mailstore,
//! optionally provisioning isolated workspaces first. Exits 0 on clean
//! shutdown (duration elapsed or SIGTERM/SIGINT) after writing a final
//! `SUPERVISOR_STOP` event; any fatal error exits non-zero.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive_core::restart::{BackoffConfig, RestartConfig};
use hive_daemon::supervisor::{default_worker_program, Supervisor, SupervisorConfig};
use hive_daemon::workspace::WorkspaceManager;
use hive_daemon::logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the hive swarm supervisor.
#[derive(Parser, Debug)]
#[command(name = "run_swarm", version, about)]
struct Args {
    /// Agent ids to supervise.
    #[arg(long, num_args = 1.., default_values_t = vec![
        "recon".to_string(),
        "forge".to_string(),
        "command".to_string(),
    ])]
    agents: Vec<String>,

    /// Use the durable SQLite substrate (the only mode; accepted for
    /// operator-script compatibility).
    #[arg(long)]
    durable: bool,

    /// Mailstore database path.
    #[arg(long, default_value = "hive_state/substrate/mailstore.db")]
    db_path: PathBuf,

    /// Stop after this many seconds; omit to run until signalled.
    #[arg(long)]
    duration_seconds: Option<f64>,

    /// Provision isolated per-agent workspaces under --workspaces-root.
    #[arg(long)]
    worktrees: bool,

    /// Shared root for per-agent workspaces.
    #[arg(long, default_value = "workspaces")]
    workspaces_root: PathBuf,

    /// Let workers claim unrouted events too.
    #[arg(long)]
    include_unrouted: bool,

    /// Restarts tolerated inside the sliding window before disablement.
    #[arg(long, default_value_t = 10)]
    max_restarts: u32,

    /// Initial restart backoff in seconds.
    #[arg(long, default_value_t = 1.0)]
    restart_backoff_seconds: f64,

    /// Supervisor heartbeat cadence in seconds.
    #[arg(long, default_value_t = 5.0)]
    heartbeat_interval_seconds: f64,

    /// Worker lease window in seconds.
    #[arg(long, default_value_t = 15.0)]
    lease_seconds: f64,

    /// Worker binary to spawn (defaults to the swarm-worker next to this
    /// executable).
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// JSONL log destination (stderr when omitted).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_file.as_deref(), &args.log_level)?;

    let agents: Vec<String> = args
        .agents
        .iter()
        .map(|a| a.trim().to_ascii_lowercase())
        .filter(|a| !a.is_empty())
        .collect();
    anyhow::ensure!(!agents.is_empty(), "at least one agent is required");
    if args.durable {
        info!("durable SQLite substrate selected (default behavior)");
    }

    let mut config = SupervisorConfig::new(args.db_path.clone(), agents.clone());
    config.include_unrouted = args.include_unrouted;
    config.lease_seconds = args.lease_seconds;
    config.heartbeat_interval = Duration::from_secs_f64(args.heartbeat_interval_seconds);
    config.heartbeat_timeout = config.heartbeat_interval * 2;
    config.restart = RestartConfig {
        window_limit: args.max_restarts,
        backoff: BackoffConfig::Exponential {
            initial_delay: Duration::from_secs_f64(args.restart_backoff_seconds),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        },
        ..RestartConfig::default()
    };
    config.worker_program = args.worker_program.unwrap_or_else(default_worker_program);
    config.runtime_log_dir = args
        .db_path
        .parent()
        .map_or_else(|| PathBuf::from("workers"), |p| p.join("workers"));

    if args.worktrees {
        let manager = WorkspaceManager::new(&args.workspaces_root)
            .context("provision workspaces root")?;
        config.workspace_roots = manager
            .ensure_all(agents.iter().map(String::as_str))
            .context("provision agent workspaces")?;
    }

    let mut supervisor = Supervisor::new(config).context("build supervisor")?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let duration = args.duration_seconds.map(Duration::from_secs_f64);
    supervisor
        .run(cancel, duration)
        .await
        .context("supervisor run failed")?;
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("install SIGINT handler");
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received; draining"),
            _ = int.recv() => info!("SIGINT received; draining"),
        }
        cancel.cancel();
    });
}
