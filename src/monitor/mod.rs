//! Cgroup lifecycle monitoring
//!
//! This module discovers and tracks the cgroup-v2 directory tree and
//! publishes typed lifecycle events on a bounded channel.
//!
//! # Architecture
//!
//! ```text
//! cgroupfs ── initial walk ──┐
//!     │                      ├──► bounded mpsc ──► route manager
//!     └── inotify stream ────┘
//! ```
//!
//! Delivery is best-effort: the underlying notification primitive can
//! coalesce or lose events under extreme load, and events beyond the
//! configured buffer are dropped rather than retried.

mod error;
mod event;
mod watcher;

pub use error::MonitorError;
pub use event::{CgroupEvent, CgroupPath, EventAck, EventKind};
pub use watcher::CgroupMonitor;
