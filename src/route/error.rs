//! Error types for the route manager

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::nft::NftError;

/// Errors produced by the route manager and policy routing
#[derive(Debug, Error)]
pub enum RouteError {
    /// A policy-routing command (`ip rule` / `ip route`) failed
    #[error("Policy routing command failed: '{command}': {stderr}")]
    PolicyRouting { command: String, stderr: String },

    /// A table apply failed. Shared because one failed batch is reported
    /// to every event acknowledgment it carried.
    #[error("nftables apply failed: {0}")]
    Nft(#[source] Arc<NftError>),

    /// I/O failure running an external command
    #[error("Route manager I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl From<NftError> for RouteError {
    fn from(error: NftError) -> Self {
        Self::Nft(Arc::new(error))
    }
}

impl From<Arc<NftError>> for RouteError {
    fn from(error: Arc<NftError>) -> Self {
        Self::Nft(error)
    }
}

impl RouteError {
    /// Check if the pipeline can keep running after this error.
    ///
    /// Apply failures are batch-local: the offending batch is dropped and
    /// consumption continues. Only a broken or misused connector session
    /// (or a failed policy-routing/setup command) is fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::PolicyRouting { .. } | Self::IoError(_) => false,
            Self::Nft(e) => !matches!(
                e.as_ref(),
                NftError::NotConnected
                    | NftError::Unavailable { .. }
                    | NftError::InvalidState { .. }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification() {
        let err: RouteError = NftError::ResourceExhausted {
            details: "ENOMEM".into(),
        }
        .into();
        assert!(err.is_recoverable());

        // A rejected batch only loses that batch; the pipeline survives
        let err: RouteError = NftError::BatchRejected {
            status: 1,
            stderr: "syntax error".into(),
        }
        .into();
        assert!(err.is_recoverable());

        let err: RouteError = NftError::NotConnected.into();
        assert!(!err.is_recoverable());

        let err = RouteError::PolicyRouting {
            command: "ip rule add".into(),
            stderr: "permission denied".into(),
        };
        assert!(!err.is_recoverable());
    }
}
