//! Cgroup tree watcher
//!
//! Walks the cgroup root once at startup, emitting a `New` event for every
//! directory found (root excluded), then streams inotify events until
//! cancelled. Watches are re-armed on every created subdirectory and the
//! directory is rescanned immediately afterwards, so bursts of nested
//! creation are observed even when grandchildren appear before the watch
//! was in place.
//!
//! Delivery is best-effort: events are pushed with `try_send` onto a
//! bounded channel and dropped with a warning once the buffer is full.
//! The buffer size is operator-tunable (`monitor.event_buffer`).

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use super::error::MonitorError;
use super::event::{CgroupEvent, CgroupPath, EventKind};

/// inotify read buffer; large enough for a burst of directory events
const EVENT_BUFFER_BYTES: usize = 4096;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::DELETE
}

/// Watches the cgroup-v2 tree and publishes lifecycle events
pub struct CgroupMonitor {
    root: PathBuf,
    events_tx: mpsc::Sender<CgroupEvent>,
}

impl CgroupMonitor {
    /// Create a monitor for the given cgroup root.
    ///
    /// Returns the monitor plus the receiving half of its event channel.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError` if the root does not exist or is not a
    /// directory.
    pub fn new(
        root: impl Into<PathBuf>,
        buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<CgroupEvent>), MonitorError> {
        let root = root.into();
        let metadata = std::fs::metadata(&root).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                MonitorError::RootNotFound { path: root.clone() }
            } else {
                MonitorError::IoError(e)
            }
        })?;
        if !metadata.is_dir() {
            return Err(MonitorError::NotADirectory { path: root });
        }

        let (events_tx, events_rx) = mpsc::channel(buffer);
        Ok((Self { root, events_tx }, events_rx))
    }

    /// The cgroup root being watched
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run the monitor until cancelled.
    ///
    /// Performs the initial recursive walk, then consumes inotify events.
    /// Returns `Ok(())` on cancellation or when the event consumer goes
    /// away; any other exit is an error.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError` if the root cannot be walked, the kernel
    /// event queue overflows, or an unregistered event kind arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), MonitorError> {
        let inotify = Inotify::init()?;
        let mut watches = inotify.watches();
        let mut wd_paths: HashMap<WatchDescriptor, PathBuf> = HashMap::new();

        let root_wd = watches.add(&self.root, watch_mask())?;
        wd_paths.insert(root_wd, self.root.clone());

        info!("watching cgroup tree at {}", self.root.display());

        let root = self.root.clone();
        if !self.walk(&mut watches, &mut wd_paths, &root, true)? {
            return Ok(());
        }
        debug!("initial walk complete, {} directories watched", wd_paths.len());

        let mut stream = inotify.into_event_stream([0u8; EVENT_BUFFER_BYTES])?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("cgroup monitor received shutdown signal");
                    return Ok(());
                }
                next = stream.next() => match next {
                    None => return Err(MonitorError::StreamClosed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(event)) => {
                        if !self.handle_event(event, &mut watches, &mut wd_paths)? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Recursively walk `dir`, arming watches and emitting `New` events.
    ///
    /// Watches are armed before descending so children created during the
    /// walk are still seen. Directories vanishing mid-walk are benign.
    /// Returns `Ok(false)` once the event consumer is gone.
    fn walk(
        &self,
        watches: &mut Watches,
        wd_paths: &mut HashMap<WatchDescriptor, PathBuf>,
        dir: &Path,
        is_root: bool,
    ) -> Result<bool, MonitorError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if is_root => {
                return Err(MonitorError::WalkError {
                    path: dir.to_path_buf(),
                    source: e,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                warn!("skipping unreadable directory {}: {}", dir.display(), e);
                return Ok(true);
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("skipping entry in {}: {}", dir.display(), e);
                    continue;
                }
            };

            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }

            let path = entry.path();
            match watches.add(&path, watch_mask()) {
                Ok(wd) => {
                    wd_paths.insert(wd, path.clone());
                }
                // The directory vanished between listing and watching
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            if !self.emit(&path, EventKind::New) {
                return Ok(false);
            }
            if !self.walk(watches, wd_paths, &path, false)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Handle one inotify event. Returns `Ok(false)` once the event
    /// consumer is gone.
    fn handle_event(
        &self,
        event: Event<OsString>,
        watches: &mut Watches,
        wd_paths: &mut HashMap<WatchDescriptor, PathBuf>,
    ) -> Result<bool, MonitorError> {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            return Err(MonitorError::QueueOverflow);
        }

        if event.mask.contains(EventMask::IGNORED) {
            wd_paths.remove(&event.wd);
            return Ok(true);
        }

        let Some(parent) = wd_paths.get(&event.wd).cloned() else {
            // Event for a watch we already forgot; deletion race
            trace!("event for unknown watch descriptor, ignoring");
            return Ok(true);
        };

        // cgroup control files churn constantly; only directories matter
        if !event.mask.contains(EventMask::ISDIR) {
            return Ok(true);
        }

        let Some(name) = event.name else {
            return Ok(true);
        };
        let path = parent.join(name);

        if event.mask.contains(EventMask::CREATE) {
            match watches.add(&path, watch_mask()) {
                Ok(wd) => {
                    wd_paths.insert(wd, path.clone());
                }
                // Created and removed before we got here
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e.into()),
            }
            if !self.emit(&path, EventKind::New) {
                return Ok(false);
            }
            // Children may have been created before our watch was armed;
            // rescan to pick them up. Duplicate New events are acceptable,
            // the consumer treats them as replacements.
            return self.walk(watches, wd_paths, &path, false);
        }

        if event.mask.contains(EventMask::DELETE) {
            return Ok(self.emit(&path, EventKind::Deleted));
        }

        Err(MonitorError::UnexpectedEvent {
            mask: event.mask.bits(),
            path,
        })
    }

    /// Publish an event, normalizing the path. Returns `false` once the
    /// consumer side of the channel is gone.
    fn emit(&self, abs: &Path, kind: EventKind) -> bool {
        let Some(path) = CgroupPath::from_absolute(&self.root, abs) else {
            return true;
        };

        trace!("cgroup {}: {}", kind, path);
        match self.events_tx.try_send(CgroupEvent::new(path, kind)) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                // Documented best-effort delivery: no retry, no correction
                warn!(
                    "event buffer full, dropping {} event for {}",
                    event.kind, event.path
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event channel closed, stopping monitor");
                false
            }
        }
    }
}
