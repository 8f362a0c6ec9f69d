//! Cgroup lifecycle event types
//!
//! A [`CgroupPath`] is always normalized: relative to the configured cgroup
//! root, `/`-prefixed, no trailing slash. It uniquely identifies a cgroup
//! for the lifetime of that directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::nft::NftError;

/// Normalized path of a cgroup, relative to the cgroup root
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CgroupPath(String);

impl CgroupPath {
    /// Create a path from a raw string, normalizing it: a `/` prefix is
    /// added if missing and trailing separators are stripped.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let mut s: String = raw.into();
        while s.ends_with('/') {
            s.pop();
        }
        if !s.starts_with('/') {
            s.insert(0, '/');
        }
        Self(s)
    }

    /// Create a path from an absolute filesystem path under `root`.
    ///
    /// Returns `None` if `abs` is not under `root` or equals it.
    #[must_use]
    pub fn from_absolute(root: &Path, abs: &Path) -> Option<Self> {
        let relative = abs.strip_prefix(root).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }
        Some(Self::new(relative.to_string_lossy().into_owned()))
    }

    /// Resolve this path back to an absolute filesystem path under `root`
    #[must_use]
    pub fn to_absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.0[1..])
    }

    /// Number of path separators; `/a` is depth 1, `/a/b` is depth 2.
    ///
    /// The set of distinct depths among tracked cgroups determines how
    /// many classification rules exist in the output chain.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.0.bytes().filter(|&b| b == b'/').count() as u32
    }

    /// The normalized path string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CgroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CgroupPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Kind of lifecycle change observed for a cgroup directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Directory appeared (initial walk or created at runtime)
    New,
    /// Directory was removed
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// Acknowledgment channel carried by an event: resolves once the
/// corresponding batch has been applied to the kernel table. The error is
/// shared because one failed batch acknowledges every event in it.
pub type EventAck = oneshot::Sender<Result<(), Arc<NftError>>>;

/// A cgroup lifecycle event
///
/// Events for the same path are not deduplicated upstream; consumers must
/// treat a `New` for an already-tracked path as a replace and a `Deleted`
/// for an untracked path as a no-op.
#[derive(Debug)]
pub struct CgroupEvent {
    /// Normalized cgroup path
    pub path: CgroupPath,
    /// Lifecycle change
    pub kind: EventKind,
    /// Optional apply acknowledgment; the monitor always sends `None`,
    /// callers injecting synthetic events may request one
    pub ack: Option<EventAck>,
}

impl CgroupEvent {
    /// Create an event without an acknowledgment channel
    #[must_use]
    pub fn new(path: CgroupPath, kind: EventKind) -> Self {
        Self {
            path,
            kind,
            ack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(CgroupPath::new("a/b").as_str(), "/a/b");
        assert_eq!(CgroupPath::new("/a/b/").as_str(), "/a/b");
        assert_eq!(CgroupPath::new("/a/b///").as_str(), "/a/b");
    }

    #[test]
    fn test_depth() {
        assert_eq!(CgroupPath::new("/a").depth(), 1);
        assert_eq!(CgroupPath::new("/a/b").depth(), 2);
        assert_eq!(CgroupPath::new("/app1/worker/x").depth(), 3);
    }

    #[test]
    fn test_from_absolute() {
        let root = Path::new("/sys/fs/cgroup");
        let path = CgroupPath::from_absolute(root, Path::new("/sys/fs/cgroup/app1/worker"));
        assert_eq!(path.unwrap().as_str(), "/app1/worker");

        // Root itself is excluded
        assert!(CgroupPath::from_absolute(root, root).is_none());
        // Paths outside the root are rejected
        assert!(CgroupPath::from_absolute(root, Path::new("/tmp/x")).is_none());
    }

    #[test]
    fn test_round_trip() {
        let root = Path::new("/sys/fs/cgroup");
        let path = CgroupPath::new("/app1/worker");
        assert_eq!(
            path.to_absolute(root),
            PathBuf::from("/sys/fs/cgroup/app1/worker")
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::New.to_string(), "new");
        assert_eq!(EventKind::Deleted.to_string(), "deleted");
    }
}
