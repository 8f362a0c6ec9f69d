//! Error types for the policy compiler and its connector

use std::io;

use thiserror::Error;

use crate::monitor::CgroupPath;

/// Errors produced by the policy compiler and connectors
#[derive(Debug, Error)]
pub enum NftError {
    /// Connector used before `connect` succeeded
    #[error("Connector is not connected")]
    NotConnected,

    /// The kernel firewall subsystem is unreachable (nft binary missing,
    /// no permission, ...)
    #[error("Firewall subsystem unavailable: {reason}")]
    Unavailable { reason: String },

    /// Operation invalid in the compiler's current lifecycle state
    #[error("Invalid operation '{operation}' in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// A cgroup directory vanished before its inode could be resolved;
    /// fails the whole batch it belonged to
    #[error("Cgroup {path} is gone: {source}")]
    CgroupGone {
        path: CgroupPath,
        #[source]
        source: io::Error,
    },

    /// A route referenced a TPROXY listener chain that was never installed
    #[error("Unknown TPROXY listener: {name}")]
    UnknownListener { name: String },

    /// Two listeners registered the same fwmark
    #[error("Duplicate fwmark {mark:#x} across listeners")]
    DuplicateMark { mark: u32 },

    /// Transient kernel resource exhaustion during flush. Recognized and
    /// swallowed at exactly one layer, the compiler's flush wrapper; the
    /// attempted change may have been silently dropped by the kernel.
    #[error("Kernel resource exhaustion: {details}")]
    ResourceExhausted { details: String },

    /// The kernel rejected the batch for a non-transient reason
    #[error("nft batch rejected (status {status}): {stderr}")]
    BatchRejected { status: i32, stderr: String },

    /// I/O failure talking to the connector
    #[error("Connector I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl NftError {
    /// Whether this error is transient kernel resource pressure that the
    /// flush wrapper swallows (documented best-effort behavior)
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = NftError::ResourceExhausted {
            details: "ENOMEM".into(),
        };
        assert!(err.is_transient());

        let err = NftError::BatchRejected {
            status: 1,
            stderr: "syntax error".into(),
        };
        assert!(!err.is_transient());
    }
}
