//! Error types for cgtproxy
//!
//! Subsystem errors (monitor, route, nft) live next to their components;
//! this module defines configuration errors and the top-level aggregate
//! used at the process boundary, with recovery classification.

use std::io;

use thiserror::Error;

use crate::monitor::MonitorError;
use crate::nft::NftError;
use crate::route::RouteError;

/// Top-level error type for cgtproxy
#[derive(Debug, Error)]
pub enum CgtproxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cgroup monitor errors
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Route manager errors
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Policy compiler / connector errors
    #[error("nftables error: {0}")]
    Nft(#[from] NftError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CgtproxyError {
    /// Check if this error is recoverable (the pipeline can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Monitor(e) => e.is_recoverable(),
            Self::Route(e) => e.is_recoverable(),
            Self::Nft(e) => e.is_transient(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, conflicting marks)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}
