//! Projection materializer: read-only fold of the durable history into the
//! view and inspection index files.
//!
//! The projector holds two cursors, both persisted inside the view
//! document. Each tick it lists events and tool audits past the cursors
//! (id-ascending), folds them through the pure fold in `hive-core`,
//! refreshes the backlog figure, and publishes both documents atomically.
//! It only ever calls the mailstore's read-only listing methods; claiming,
//! acking, failing, or publishing from here would be a programming error,
//! and the type simply has no path to those operations.

use std::time::Duration;

use hive_core::event::iso_now;
use hive_core::inspection::build_inspection_index;
use hive_core::view::ProjectionView;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsio::FsIoError;
use crate::mailstore::{MailStore, MailStoreError};
use crate::view_store::{IndexStore, ViewStore};

/// Errors from projection.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// The mailstore failed while listing.
    #[error(transparent)]
    Store(#[from] MailStoreError),

    /// Publishing a document failed.
    #[error(transparent)]
    Publish(#[from] FsIoError),
}

/// Projector tuning.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Sleep between ticks.
    pub poll_interval: Duration,
    /// Rows listed per batch.
    pub batch: u32,
    /// How many trailing events feed the inspection timeline.
    pub timeline_window: u32,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch: 1000,
            timeline_window: 200,
        }
    }
}

/// Read-only projector: durable events and tool audits in, materialized
/// view and inspection index out.
pub struct Projector {
    mail_store: MailStore,
    view_store: ViewStore,
    index_store: IndexStore,
    config: ProjectorConfig,
}

impl Projector {
    /// Build a projector over the given store and output paths.
    #[must_use]
    pub fn new(
        mail_store: MailStore,
        view_store: ViewStore,
        index_store: IndexStore,
        config: ProjectorConfig,
    ) -> Self {
        Self {
            mail_store,
            view_store,
            index_store,
            config,
        }
    }

    /// One projection tick: fold everything new, publish both documents,
    /// and return the published view.
    pub fn project_once(&self) -> Result<ProjectionView, ProjectorError> {
        let mut view = self.view_store.load();

        loop {
            let events = self
                .mail_store
                .list_events(view.last_seen_event_id, self.config.batch)?;
            let drained = events.len() < self.config.batch as usize;
            view.fold_events(&events);
            if drained {
                break;
            }
        }

        loop {
            let audits = self
                .mail_store
                .list_tool_audit(view.last_seen_tool_audit_id, self.config.batch)?;
            let drained = audits.len() < self.config.batch as usize;
            for audit in &audits {
                view.apply_audit(audit.id, audit.allowed);
            }
            if drained {
                break;
            }
        }

        let pending = self
            .mail_store
            .status_counts()?
            .get("PENDING")
            .copied()
            .unwrap_or(0);
        view.set_queue_size(pending);

        let stamp = iso_now();
        view.timestamp = stamp.clone();
        view.last_updated_at = stamp;

        self.view_store.save(&view)?;

        let window_start = view
            .last_seen_event_id
            .saturating_sub(i64::from(self.config.timeline_window));
        let timeline_events = self
            .mail_store
            .list_events(window_start, self.config.timeline_window)?;
        match build_inspection_index(&view, &timeline_events) {
            Ok(index) => self.index_store.save(&index)?,
            Err(err) => warn!(%err, "failed to build inspection index"),
        }

        debug!(
            last_seen_event_id = view.last_seen_event_id,
            last_seen_tool_audit_id = view.last_seen_tool_audit_id,
            queue = view.event_queue_size,
            "projection tick published"
        );
        Ok(view)
    }

    /// Run projection ticks until cancelled; a final tick runs after
    /// cancellation so the published view reflects the last observed state.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProjectorError> {
        info!(
            view = %self.view_store.path().display(),
            index = %self.index_store.path().display(),
            "projector starting"
        );
        loop {
            self.project_once()?;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }
        self.project_once()?;
        info!("projector stopped");
        Ok(())
    }
}
