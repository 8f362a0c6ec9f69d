//! End-to-end pipeline tests
//!
//! Filesystem changes under a temporary cgroup root flow through the real
//! inotify monitor and route manager; assertions run against the batches
//! captured by the recording connector.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use cgtproxy::config::{DecisionConfig, RuleConfig, TproxyConfig};
use cgtproxy::monitor::{CgroupMonitor, MonitorError};
use cgtproxy::nft::{Batch, PolicyCompiler, RecordingConnector};
use cgtproxy::route::{PolicyRouting, RouteError, RouteManager, RouteMatcher};

const SETTLE: Duration = Duration::from_millis(200);

fn listeners() -> HashMap<String, TproxyConfig> {
    let mut map = HashMap::new();
    map.insert(
        "t1".to_string(),
        TproxyConfig {
            port: 7893,
            mark: 0x20,
            allow_udp: true,
            allow_ipv6: true,
            dns_hijack: None,
        },
    );
    map
}

fn rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            pattern: "^/proxied".into(),
            decision: DecisionConfig::Tproxy("t1".into()),
        },
        RuleConfig {
            pattern: "^/blocked".into(),
            decision: DecisionConfig::Drop,
        },
    ]
}

struct Pipeline {
    recorder: RecordingConnector,
    shutdown: broadcast::Sender<()>,
    monitor: JoinHandle<Result<(), MonitorError>>,
    manager: JoinHandle<Result<(), RouteError>>,
}

impl Pipeline {
    async fn spawn(root: &Path) -> Self {
        let recorder = RecordingConnector::new();
        let compiler = PolicyCompiler::new(
            recorder.clone(),
            root,
            vec!["127.0.0.0/8".parse().unwrap()],
        );
        let matcher = RouteMatcher::from_rules(&rules()).unwrap();
        let policy = PolicyRouting::with_program("true", 300, vec![0x20]);

        let (monitor, events) = CgroupMonitor::new(root, 64).unwrap();
        let mut manager = RouteManager::new(compiler, matcher, policy, listeners(), events);
        manager.setup().await.unwrap();

        let (shutdown, _) = broadcast::channel(4);
        let monitor = tokio::spawn(monitor.run(shutdown.subscribe()));
        let manager = tokio::spawn(manager.run(shutdown.subscribe()));
        Self {
            recorder,
            shutdown,
            monitor,
            manager,
        }
    }

    fn script(&self) -> String {
        self.recorder.applied().iter().map(Batch::render).collect()
    }

    /// Poll until the rendered script satisfies the predicate
    async fn wait_for(&self, what: &str, predicate: impl Fn(&str) -> bool) {
        for _ in 0..100 {
            if predicate(&self.script()) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}; script so far:\n{}", self.script());
    }

    async fn finish(self) {
        self.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.monitor)
            .await
            .expect("monitor did not stop")
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.manager)
            .await
            .expect("manager did not stop")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_preexisting_cgroups_routed_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("proxied.slice/app")).unwrap();

    let pipeline = Pipeline::spawn(dir.path()).await;
    pipeline
        .wait_for("initial walk routes", |s| {
            s.contains("goto t1-mark") && s.contains("socket cgroupv2 level 2")
        })
        .await;

    pipeline.finish().await;
}

#[tokio::test]
async fn test_runtime_create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::spawn(dir.path()).await;
    sleep(SETTLE).await;

    fs::create_dir(dir.path().join("blocked.slice")).unwrap();
    pipeline
        .wait_for("drop route for new cgroup", |s| s.contains(": drop"))
        .await;

    fs::remove_dir(dir.path().join("blocked.slice")).unwrap();
    pipeline
        .wait_for("route removal", |s| s.contains("delete element"))
        .await;

    pipeline.finish().await;
}

#[tokio::test]
async fn test_shutdown_tears_down_table() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::spawn(dir.path()).await;
    sleep(SETTLE).await;

    let recorder = pipeline.recorder.clone();
    pipeline.finish().await;

    let script: String = recorder.applied().iter().map(Batch::render).collect();
    assert!(script.contains("delete table inet cgtproxy"));
}

#[tokio::test]
async fn test_unmatched_cgroups_do_not_touch_kernel() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("system.slice")).unwrap();

    let pipeline = Pipeline::spawn(dir.path()).await;
    // Setup applied exactly two batches: base table and listener chains
    let setup_batches = 2;
    sleep(SETTLE).await;

    fs::create_dir(dir.path().join("user.slice")).unwrap();
    sleep(SETTLE).await;

    assert_eq!(pipeline.recorder.applied_count(), setup_batches);
    pipeline.finish().await;
}

#[tokio::test]
async fn test_nested_burst_is_fully_routed() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::spawn(dir.path()).await;
    sleep(SETTLE).await;

    // Create a nested subtree in one burst; rescan-after-create must pick
    // up children racing the watch registration
    fs::create_dir_all(dir.path().join("proxied.slice/a/b")).unwrap();
    pipeline
        .wait_for("deepest nested route", |s| s.contains("socket cgroupv2 level 3"))
        .await;

    pipeline.finish().await;
}
