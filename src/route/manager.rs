//! Route manager: the pipeline stage between monitor and compiler
//!
//! Consumes cgroup lifecycle events, resolves each path to a forwarding
//! decision through the rule matcher and drives the policy compiler.
//! Events are drained in batches so a burst of cgroup churn becomes a
//! small number of kernel transactions instead of one per directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::error::RouteError;
use super::matcher::RouteMatcher;
use super::policy::PolicyRouting;
use crate::config::TproxyConfig;
use crate::monitor::{CgroupEvent, CgroupPath, EventAck, EventKind};
use crate::nft::{Connector, NftError, PolicyCompiler, Target};

/// Maximum events drained per batch
const EVENT_BATCH_MAX: usize = 64;

/// A run of consecutive same-kind events, applied as one transaction
enum Segment {
    Add(Vec<(CgroupPath, Target)>, Vec<EventAck>),
    Remove(Vec<CgroupPath>, Vec<EventAck>),
}

/// Drives the policy compiler from the monitor's event stream
pub struct RouteManager<C: Connector> {
    compiler: PolicyCompiler<C>,
    matcher: RouteMatcher,
    policy: PolicyRouting,
    tproxies: HashMap<String, TproxyConfig>,
    events: mpsc::Receiver<CgroupEvent>,
}

impl<C: Connector> RouteManager<C> {
    /// Assemble the manager from its already-constructed parts
    pub fn new(
        compiler: PolicyCompiler<C>,
        matcher: RouteMatcher,
        policy: PolicyRouting,
        tproxies: HashMap<String, TproxyConfig>,
        events: mpsc::Receiver<CgroupEvent>,
    ) -> Self {
        Self {
            compiler,
            matcher,
            policy,
            tproxies,
            events,
        }
    }

    /// Bring up the full forwarding path: connect, install the base
    /// table, the listener chains and the policy-routing rules.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal setup failure; nothing is rolled back
    /// (teardown at shutdown removes whatever was installed).
    pub async fn setup(&mut self) -> Result<(), RouteError> {
        self.compiler.connect().await?;
        self.compiler.install().await?;
        self.compiler.add_listeners(&self.tproxies).await?;
        self.policy.install().await?;
        info!("route manager ready ({} rules)", self.matcher.len());
        Ok(())
    }

    /// Consume events until shutdown or the monitor goes away, then tear
    /// everything down in reverse order of setup.
    ///
    /// # Errors
    ///
    /// Apply failures only fail their own batch: the error is sent to the
    /// batch's event acknowledgments, logged with the offending paths and
    /// decisions, and consumption continues. Only a broken connector
    /// session stops the loop early.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RouteError> {
        let result = self.event_loop(&mut shutdown).await;
        self.teardown().await;
        result
    }

    async fn event_loop(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), RouteError> {
        let mut buffer = Vec::with_capacity(EVENT_BATCH_MAX);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("route manager shutting down");
                    return Ok(());
                }
                drained = self.events.recv_many(&mut buffer, EVENT_BATCH_MAX) => {
                    if drained == 0 {
                        info!("event stream closed, route manager stopping");
                        return Ok(());
                    }
                    debug!("processing {drained} cgroup events");
                    self.handle_batch(buffer.drain(..).collect()).await?;
                }
            }
        }
    }

    /// Apply one drained batch. Consecutive same-kind events collapse
    /// into one transaction each; kind changes start a new segment so
    /// that create/delete ordering for the same path is preserved.
    async fn handle_batch(&mut self, events: Vec<CgroupEvent>) -> Result<(), RouteError> {
        for segment in Self::segment(events, &self.matcher) {
            match segment {
                Segment::Add(entries, acks) => {
                    match self.compiler.add_routes(&entries).await {
                        Ok(()) => Self::ack_ok(acks),
                        Err(error) => {
                            let detail: Vec<String> = entries
                                .iter()
                                .map(|(path, target)| format!("{path} ({target})"))
                                .collect();
                            Self::fail_batch(error, acks, &detail.join(", "))?;
                        }
                    }
                }
                Segment::Remove(paths, acks) => {
                    match self.compiler.remove_routes(&paths).await {
                        Ok(()) => Self::ack_ok(acks),
                        Err(error) => {
                            let detail: Vec<String> =
                                paths.iter().map(ToString::to_string).collect();
                            Self::fail_batch(error, acks, &detail.join(", "))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn segment(events: Vec<CgroupEvent>, matcher: &RouteMatcher) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        for event in events {
            match (event.kind, segments.last_mut()) {
                (EventKind::New, Some(Segment::Add(entries, acks))) => {
                    entries.push((event.path.clone(), matcher.resolve(&event.path)));
                    acks.extend(event.ack);
                }
                (EventKind::New, _) => {
                    let target = matcher.resolve(&event.path);
                    segments.push(Segment::Add(
                        vec![(event.path, target)],
                        event.ack.into_iter().collect(),
                    ));
                }
                (EventKind::Deleted, Some(Segment::Remove(paths, acks))) => {
                    paths.push(event.path);
                    acks.extend(event.ack);
                }
                (EventKind::Deleted, _) => {
                    segments.push(Segment::Remove(
                        vec![event.path],
                        event.ack.into_iter().collect(),
                    ));
                }
            }
        }
        segments
    }

    fn ack_ok(acks: Vec<EventAck>) {
        for ack in acks {
            let _ = ack.send(Ok(()));
        }
    }

    /// Report a failed segment to its acknowledgments and decide whether
    /// the pipeline survives it. The batch itself is always lost; only a
    /// broken connector session stops the manager.
    fn fail_batch(error: NftError, acks: Vec<EventAck>, detail: &str) -> Result<(), RouteError> {
        let shared = Arc::new(error);
        for ack in acks {
            let _ = ack.send(Err(shared.clone()));
        }
        let error = RouteError::Nft(shared);
        if error.is_recoverable() {
            warn!("dropping event batch [{detail}]: {error}");
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Reverse-order teardown, best effort throughout
    async fn teardown(&mut self) {
        self.policy.remove().await;
        if let Err(e) = self.compiler.clear().await {
            warn!("table teardown failed: {e}");
        }
        if let Err(e) = self.compiler.release().await {
            warn!("connector release failed: {e}");
        }
        info!("route manager torn down");
    }
}
