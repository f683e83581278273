//! Atomic file I/O for the projection view and inspection index.
//!
//! Writes go to a temp file in the destination directory, are fsynced,
//! atomically renamed over the final path, and the parent directory entry
//! is fsynced. A crash at any point leaves either the old complete file or
//! the new complete file, never a torn one. Reads are size-capped before
//! allocation so a corrupted file cannot exhaust memory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;

/// Default cap on state file reads.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from atomic file operations.
#[derive(Debug, thiserror::Error)]
pub enum FsIoError {
    /// The destination has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error with the operation that failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another process holds the writer lock.
    #[error("writer lock at {} is held by another process", path.display())]
    LockHeld {
        /// Lock file path.
        path: PathBuf,
    },
}

impl FsIoError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Write `data` to `path` via temp file + fsync + rename + parent fsync.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsIoError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| FsIoError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;
    std::fs::create_dir_all(parent).map_err(|e| FsIoError::io("create parent directory", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsIoError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsIoError::io("write to temp file", e))?;
    tmp.flush().map_err(|e| FsIoError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsIoError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsIoError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)?;
    Ok(())
}

/// Read and deserialize a JSON file, capping the size before allocation.
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max: u64) -> Result<T, FsIoError> {
    let metadata = std::fs::metadata(path).map_err(|e| FsIoError::io("stat state file", e))?;
    if metadata.len() > max {
        return Err(FsIoError::FileTooLarge {
            size: metadata.len(),
            max,
        });
    }
    let raw = std::fs::read_to_string(path).map_err(|e| FsIoError::io("read state file", e))?;
    serde_json::from_str(&raw).map_err(FsIoError::DeserializeFailed)
}

fn fsync_directory(dir: &Path) -> Result<(), FsIoError> {
    let handle = File::open(dir).map_err(|e| FsIoError::io("open parent directory", e))?;
    handle
        .sync_all()
        .map_err(|e| FsIoError::io("fsync parent directory", e))
}

/// Exclusive advisory lock marking one process as the writer for a state
/// file. Held for the lifetime of the value; a second acquirer fails
/// immediately instead of silently double-writing.
#[derive(Debug)]
pub struct WriterLock {
    _file: File,
    path: PathBuf,
}

impl WriterLock {
    /// Acquire the lock file next to `state_path` (`<state>.lock`).
    pub fn acquire(state_path: &Path) -> Result<Self, FsIoError> {
        let mut lock_path = state_path.as_os_str().to_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FsIoError::io("create lock directory", e))?;
        }
        let file = File::create(&lock_path).map_err(|e| FsIoError::io("create lock file", e))?;
        file.try_lock_exclusive()
            .map_err(|_| FsIoError::LockHeld {
                path: lock_path.clone(),
            })?;
        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
