//! cgtproxy: cgroup-based transparent proxy control plane
//!
//! This crate watches the cgroup-v2 hierarchy and translates per-cgroup
//! routing rules into kernel firewall state, so traffic can be proxied,
//! dropped or passed through based on which cgroup a process lives in.
//!
//! # Architecture
//!
//! ```text
//! cgroupfs (inotify) → CgroupMonitor → events → RouteManager
//!                                                   ↓
//!                                 RouteMatcher (first match wins)
//!                                                   ↓
//!                                 PolicyCompiler → nftables table
//! ```
//!
//! The compiler owns one `inet cgtproxy` table. Classification happens in
//! its output chain: one `socket cgroupv2 level N` rule per distinct depth
//! of tracked cgroups, ordered deepest first, so a child cgroup's rule
//! always beats an inherited parent rule.
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`monitor`]: Cgroup lifecycle monitoring
//! - [`nft`]: Firewall table synthesis
//! - [`route`]: Rule matching and route management

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod monitor;
pub mod nft;
pub mod route;

// Re-export commonly used types at the crate root
pub use config::{load_config, Config, TproxyConfig};
pub use error::{CgtproxyError, ConfigError};
pub use monitor::{CgroupEvent, CgroupMonitor, CgroupPath, EventKind, MonitorError};
pub use nft::{Connector, NftCliConnector, NftError, PolicyCompiler, Target};
pub use route::{PolicyRouting, RouteError, RouteManager, RouteMatcher};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
