//! Connectors: how staged batches reach the kernel
//!
//! A [`Connector`] opens a session to the kernel firewall subsystem and
//! applies batches of staged operations transactionally. The production
//! implementation renders batches to `nft -f` script text and feeds it to
//! the `nft` binary in one invocation (one invocation = one kernel
//! transaction). The recording implementation captures batches in memory
//! for tests and dry runs.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::error::NftError;
use super::ops::Batch;

/// stderr fragments that indicate transient kernel resource pressure
const TRANSIENT_MARKERS: &[&str] = &[
    "Cannot allocate memory",
    "Out of memory",
    "Resource temporarily unavailable",
];

/// Session to the kernel firewall subsystem
#[async_trait]
pub trait Connector: Send {
    /// Open the session
    async fn connect(&mut self) -> Result<(), NftError>;

    /// Apply a batch of staged operations as one transaction.
    ///
    /// Either the whole batch takes effect or none of it does.
    async fn apply(&mut self, batch: &Batch) -> Result<(), NftError>;

    /// Release the session; further `apply` calls are invalid
    async fn release(&mut self) -> Result<(), NftError>;
}

/// Production connector driving the `nft` binary
#[derive(Debug)]
pub struct NftCliConnector {
    program: String,
    connected: bool,
}

impl NftCliConnector {
    /// Create a connector using `nft` from `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("nft")
    }

    /// Create a connector using a specific nft binary
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            connected: false,
        }
    }
}

impl Default for NftCliConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for NftCliConnector {
    async fn connect(&mut self) -> Result<(), NftError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| NftError::Unavailable {
                reason: format!("cannot execute '{}': {e}", self.program),
            })?;

        if !output.status.success() {
            return Err(NftError::Unavailable {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            "connected to nftables via {}: {}",
            self.program,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        self.connected = true;
        Ok(())
    }

    async fn apply(&mut self, batch: &Batch) -> Result<(), NftError> {
        if !self.connected {
            return Err(NftError::NotConnected);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let script = batch.render();
        trace!("applying nft batch:\n{script}");

        let mut child = Command::new(&self.program)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(NftError::ResourceExhausted { details: stderr });
        }

        Err(NftError::BatchRejected {
            status: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    async fn release(&mut self) -> Result<(), NftError> {
        self.connected = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    connected: bool,
    applied: Vec<Batch>,
    errors: VecDeque<NftError>,
}

/// Connector that records applied batches instead of touching the kernel.
///
/// Clones share state, so a test can keep a handle while the compiler owns
/// another. Errors queued with [`RecordingConnector::inject_error`] are
/// returned by the next `apply` calls, in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingConnector {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches applied so far, in order
    #[must_use]
    pub fn applied(&self) -> Vec<Batch> {
        self.state.lock().expect("recorder poisoned").applied.clone()
    }

    /// Number of batches applied so far
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.state.lock().expect("recorder poisoned").applied.len()
    }

    /// Queue an error to be returned by an upcoming `apply`
    pub fn inject_error(&self, error: NftError) {
        self.state
            .lock()
            .expect("recorder poisoned")
            .errors
            .push_back(error);
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&mut self) -> Result<(), NftError> {
        self.state.lock().expect("recorder poisoned").connected = true;
        Ok(())
    }

    async fn apply(&mut self, batch: &Batch) -> Result<(), NftError> {
        let mut state = self.state.lock().expect("recorder poisoned");
        if !state.connected {
            return Err(NftError::NotConnected);
        }
        if let Some(error) = state.errors.pop_front() {
            return Err(error);
        }
        state.applied.push(batch.clone());
        Ok(())
    }

    async fn release(&mut self) -> Result<(), NftError> {
        self.state.lock().expect("recorder poisoned").connected = false;
        Ok(())
    }
}
