//! `run_projector` - projection materializer entry point.
//!
//! Tails the mailstore read-only and atomically publishes the view and
//! inspection index documents. A writer lock next to the view file keeps
//! the projection single-writer; a second projector on the same path exits
//! non-zero immediately.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive_daemon::fsio::WriterLock;
use hive_daemon::logging;
use hive_daemon::mailstore::{MailStore, MailStoreConfig};
use hive_daemon::projector::{Projector, ProjectorConfig};
use hive_daemon::view_store::{IndexStore, ViewStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the hive projection materializer.
#[derive(Parser, Debug)]
#[command(name = "run_projector", version, about)]
struct Args {
    /// Mailstore database path.
    #[arg(long)]
    mailstore_db: PathBuf,

    /// Projection view output path.
    #[arg(long, default_value = "hive_state/projection/view.json")]
    view_path: PathBuf,

    /// Inspection index output path.
    #[arg(long, default_value = "hive_state/inspection/index.json")]
    index_path: PathBuf,

    /// Seconds between projection ticks.
    #[arg(long, default_value_t = 0.5)]
    poll_interval: f64,

    /// Rows listed per batch.
    #[arg(long, default_value_t = 1000)]
    batch: u32,

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

    let _writer_lock =
        WriterLock::acquire(&args.view_path).context("acquire projector writer lock")?;

    let mail_store = MailStore::open(&args.mailstore_db, MailStoreConfig::default())
        .context("open mailstore")?;
    let projector = Projector::new(
        mail_store,
        ViewStore::new(&args.view_path),
        IndexStore::new(&args.index_path),
        ProjectorConfig {
            poll_interval: Duration::from_secs_f64(args.poll_interval.max(0.05)),
            batch: args.batch.max(1),
            ..ProjectorConfig::default()
        },
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
                _ = term.recv() => info!("SIGTERM received"),
                _ = int.recv() => info!("SIGINT received"),
            }
            cancel.cancel();
        });
    }

    projector.run(cancel).await.context("projector run failed")?;
    Ok(())
}
