//! Per-agent workspace provisioning.
//!
//! Every worker owns one directory under a shared workspaces root. The
//! manager creates directories on demand and guarantees the resolved path
//! is a strict descendant of the root; symlinked or `..`-laden agent ids
//! never escape it. Nothing is ever shared between two workers' trees.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

/// Errors from workspace provisioning.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The agent id cannot name a directory.
    #[error("invalid agent id: {0:?}")]
    InvalidAgentId(String),

    /// The resolved workspace path left the shared root.
    #[error("workspace path escapes root: {}", path.display())]
    EscapesRoot {
        /// The offending resolved path.
        path: PathBuf,
    },

    /// No workspace exists for the agent.
    #[error("missing workspace for agent '{0}'")]
    Missing(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates and validates per-agent workspace isolation.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    workspaces_root: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `workspaces_root`, creating the root if
    /// necessary.
    pub fn new(workspaces_root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = workspaces_root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            workspaces_root: root.canonicalize()?,
        })
    }

    /// The canonicalized shared root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.workspaces_root
    }

    /// Provision (or find) the workspace for one agent.
    pub fn ensure(&self, agent_id: &str) -> Result<PathBuf, WorkspaceError> {
        let normalized = normalize_agent_id(agent_id)?;
        let path = self.workspaces_root.join(&normalized);
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
            info!(agent_id = %normalized, path = %path.display(), "provisioned workspace");
        }
        let resolved = path.canonicalize()?;
        if !resolved.starts_with(&self.workspaces_root) || resolved == self.workspaces_root {
            return Err(WorkspaceError::EscapesRoot { path: resolved });
        }
        Ok(resolved)
    }

    /// Provision workspaces for a whole roster.
    pub fn ensure_all<'a, I: IntoIterator<Item = &'a str>>(
        &self,
        agent_ids: I,
    ) -> Result<HashMap<String, PathBuf>, WorkspaceError> {
        let mut result = HashMap::new();
        for agent_id in agent_ids {
            let normalized = normalize_agent_id(agent_id)?;
            let path = self.ensure(&normalized)?;
            result.insert(normalized, path);
        }
        Ok(result)
    }

    /// The existing workspace for an agent; errors when it was never
    /// provisioned.
    pub fn path_for(&self, agent_id: &str) -> Result<PathBuf, WorkspaceError> {
        let normalized = normalize_agent_id(agent_id)?;
        let path = self.workspaces_root.join(&normalized);
        if !path.exists() {
            return Err(WorkspaceError::Missing(normalized));
        }
        let resolved = path.canonicalize()?;
        if !resolved.starts_with(&self.workspaces_root) {
            return Err(WorkspaceError::EscapesRoot { path: resolved });
        }
        Ok(resolved)
    }
}

/// Lower-case the id and refuse anything that is not a plain path segment.
fn normalize_agent_id(agent_id: &str) -> Result<String, WorkspaceError> {
    let normalized = agent_id.trim().to_ascii_lowercase();
    if normalized.is_empty()
        || normalized == "."
        || normalized == ".."
        || normalized.contains(['/', '\\', '\0'])
    {
        return Err(WorkspaceError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(normalized)
}
