//! Error types for the path watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while constructing or driving a watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Filesystem I/O error (stat, walk).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OS-level watch registration error.
    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    /// An empty string was given where a path is required.
    #[error("path must not be empty")]
    EmptyPath,

    /// `replace` was asked to install a path that is already tracked.
    #[error("path is already tracked: {0}")]
    AlreadyTracked(PathBuf),

    /// The watcher has been stopped; its OS watch handle is gone.
    #[error("watcher has been stopped")]
    Stopped,

    /// The background loop terminated abnormally.
    #[error("watcher task failed: {0}")]
    Task(String),
}

/// Result alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;
