//! Atomic persistence for the projection view and inspection index.
//!
//! Both documents are written in canonical form (compact, sorted keys) via
//! the temp-file + fsync + rename protocol, so readers always observe a
//! complete document and identical view states produce identical bytes.

use std::path::{Path, PathBuf};

use hive_core::canonical::to_canonical_string;
use hive_core::inspection::InspectionIndex;
use hive_core::view::ProjectionView;
use tracing::warn;

use crate::fsio::{self, FsIoError, DEFAULT_MAX_FILE_SIZE};

/// Atomic JSON persistence for the projection materialized view.
#[derive(Debug, Clone)]
pub struct ViewStore {
    path: PathBuf,
}

impl ViewStore {
    /// Create a store for the view file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the view file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted view. Missing or corrupt files yield the default
    /// (empty) view; the projector re-folds forward from its cursors.
    #[must_use]
    pub fn load(&self) -> ProjectionView {
        if !self.path.exists() {
            return ProjectionView::default();
        }
        match fsio::bounded_read_json(&self.path, DEFAULT_MAX_FILE_SIZE) {
            Ok(view) => view,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unreadable view file; starting empty");
                ProjectionView::default()
            },
        }
    }

    /// Persist the view atomically in canonical form.
    pub fn save(&self, view: &ProjectionView) -> Result<(), FsIoError> {
        let canonical = view
            .to_canonical_json()
            .map_err(FsIoError::SerializeFailed)?;
        fsio::atomic_write(&self.path, format!("{canonical}\n").as_bytes())
    }
}

/// Atomic JSON persistence for the inspection index.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    /// Create a store for the index file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the index file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the index atomically in canonical form.
    pub fn save(&self, index: &InspectionIndex) -> Result<(), FsIoError> {
        let canonical = to_canonical_string(index).map_err(FsIoError::SerializeFailed)?;
        fsio::atomic_write(&self.path, format!("{canonical}\n").as_bytes())
    }

    /// Load the persisted index, if readable.
    #[must_use]
    pub fn load(&self) -> Option<InspectionIndex> {
        if !self.path.exists() {
            return None;
        }
        fsio::bounded_read_json(&self.path, DEFAULT_MAX_FILE_SIZE).ok()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_view_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = ViewStore::new(dir.path().join("view.json"));
        assert_eq!(store.load(), ProjectionView::default());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ViewStore::new(dir.path().join("view.json"));

        let mut view = ProjectionView::default();
        view.set_queue_size(7);
        view.running = true;
        view.refresh_derived();
        store.save(&view).unwrap();

        assert_eq!(store.load(), view);
    }

    #[test]
    fn corrupt_view_loads_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("view.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ViewStore::new(&path);
        assert_eq!(store.load(), ProjectionView::default());
    }

    #[test]
    fn identical_views_produce_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let first_path = dir.path().join("a.json");
        let second_path = dir.path().join("b.json");

        let mut view = ProjectionView::default();
        view.running = true;
        view.refresh_derived();

        ViewStore::new(&first_path).save(&view).unwrap();
        ViewStore::new(&second_path).save(&view).unwrap();
        assert_eq!(
            std::fs::read(&first_path).unwrap(),
            std::fs::read(&second_path).unwrap()
        );
    }
}
