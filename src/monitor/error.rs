//! Error types for the cgroup monitor

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the cgroup monitor
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The configured cgroup root does not exist
    #[error("Cgroup root not found: {path}")]
    RootNotFound { path: PathBuf },

    /// The configured cgroup root is not a directory
    #[error("Cgroup root is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Failed to read the cgroup root during the initial walk
    #[error("Failed to walk cgroup root {path}: {source}")]
    WalkError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The kernel's inotify event queue overflowed; events were lost and
    /// the tracked state can no longer be trusted
    #[error("inotify event queue overflowed")]
    QueueOverflow,

    /// An event arrived that the monitor did not register for
    /// (configuration or kernel mismatch, not retried)
    #[error("Unexpected inotify event mask {mask:#x} for {path}")]
    UnexpectedEvent { mask: u32, path: PathBuf },

    /// The inotify event stream ended without cancellation
    #[error("inotify event stream closed unexpectedly")]
    StreamClosed,

    /// inotify initialization or watch registration failure
    #[error("inotify error: {0}")]
    IoError(#[from] io::Error),
}

impl MonitorError {
    /// Monitor errors terminate the run; none are retried in place
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}
