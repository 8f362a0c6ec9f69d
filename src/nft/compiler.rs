//! Stateful policy compiler
//!
//! Compiles `(CgroupPath, Target)` bindings and TPROXY listener definitions
//! into one kernel firewall table. Rule order in the output chain encodes
//! priority semantics the kernel does not natively express: one
//! classification rule per distinct cgroup depth, deepest first, so a child
//! cgroup's policy always overrides an inherited parent policy.
//!
//! # Table layout
//!
//! ```text
//! table inet cgtproxy {
//!     set bypass / bypass6          destinations never intercepted
//!     map cgroup-vmap               cgroup inode -> verdict
//!     map mark-vmap                 fwmark -> listener chain
//!     map mark-dns-vmap             fwmark -> DNS hijack chain
//!     chain output                  guards + per-depth classification
//!     chain prerouting              bypass + TPROXY dispatch by mark
//!     chain nat-output              DNS hijack dispatch by mark
//!     chain <t>, <t>-mark, <t>-dns  one triple per listener
//! }
//! ```
//!
//! # Lifecycle
//!
//! `Uninstalled -> Installed -> (routes/listeners mutate) -> Torn down`.
//! The compiler is not reusable after teardown and is not reentrant; all
//! mutating operations must be serialized by the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use super::connector::Connector;
use super::error::NftError;
use super::ops::{
    Batch, HookSpec, NftOp, Verdict, CHAIN_NAT_OUTPUT, CHAIN_OUTPUT, CHAIN_PREROUTING, MAP_CGROUP,
    MAP_MARK, MAP_MARK_DNS, SET_BYPASS, SET_BYPASS6,
};
use crate::config::TproxyConfig;
use crate::monitor::CgroupPath;

/// Operation kind of a forwarding decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOp {
    /// No decision; nothing is installed
    Noop,
    /// Accept as-is, stop classification
    Direct,
    /// Drop all traffic
    Drop,
    /// Redirect through a TPROXY listener chain
    Tproxy,
}

/// A forwarding decision, optionally referencing a listener chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Decision kind
    pub op: TargetOp,
    /// Listener name for `Tproxy`; empty otherwise
    pub chain: Option<String>,
}

impl Target {
    /// No decision
    #[must_use]
    pub const fn noop() -> Self {
        Self {
            op: TargetOp::Noop,
            chain: None,
        }
    }

    /// Accept as-is
    #[must_use]
    pub const fn direct() -> Self {
        Self {
            op: TargetOp::Direct,
            chain: None,
        }
    }

    /// Drop traffic
    #[must_use]
    pub const fn drop() -> Self {
        Self {
            op: TargetOp::Drop,
            chain: None,
        }
    }

    /// Redirect to the named TPROXY listener
    #[must_use]
    pub fn tproxy(listener: impl Into<String>) -> Self {
        Self {
            op: TargetOp::Tproxy,
            chain: Some(listener.into()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.op, &self.chain) {
            (TargetOp::Noop, _) => f.write_str("noop"),
            (TargetOp::Direct, _) => f.write_str("direct"),
            (TargetOp::Drop, _) => f.write_str("drop"),
            (TargetOp::Tproxy, Some(chain)) => write!(f, "tproxy({chain})"),
            (TargetOp::Tproxy, None) => f.write_str("tproxy(?)"),
        }
    }
}

/// One installed route: the cgroup's inode plus its decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Inode of the cgroup directory, the key in the cgroup verdict map
    pub inode: u64,
    /// The installed decision
    pub target: Target,
}

/// Compiler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Uninstalled,
    Installed,
    TornDown,
}

impl TableState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::TornDown => "torn down",
        }
    }
}

fn mark_chain(listener: &str) -> String {
    format!("{listener}-mark")
}

fn dns_chain(listener: &str) -> String {
    format!("{listener}-dns")
}

/// Incremental compiler from forwarding decisions to a live kernel table
pub struct PolicyCompiler<C: Connector> {
    connector: C,
    cgroup_root: PathBuf,
    bypass: Vec<IpNet>,
    /// Single source of truth for what is currently installed
    routes: HashMap<CgroupPath, RouteEntry>,
    /// Installed listeners: name -> fwmark
    listeners: HashMap<String, u32>,
    /// Depths currently rendered in the output chain
    installed_depths: BTreeSet<u32>,
    state: TableState,
}

impl<C: Connector> PolicyCompiler<C> {
    /// Create a compiler over the given connector.
    ///
    /// `cgroup_root` is used to resolve cgroup paths to inode numbers;
    /// `bypass` holds the destination prefixes excluded from interception.
    pub fn new(connector: C, cgroup_root: impl Into<PathBuf>, bypass: Vec<IpNet>) -> Self {
        Self {
            connector,
            cgroup_root: cgroup_root.into(),
            bypass,
            routes: HashMap::new(),
            listeners: HashMap::new(),
            installed_depths: BTreeSet::new(),
            state: TableState::Uninstalled,
        }
    }

    /// Open the connector session
    ///
    /// # Errors
    ///
    /// Returns `NftError` if the kernel firewall subsystem is unreachable.
    pub async fn connect(&mut self) -> Result<(), NftError> {
        self.connector.connect().await
    }

    /// Install the base table: sets, verdict maps and hook chains.
    ///
    /// # Errors
    ///
    /// Fatal setup error if the batch is rejected; also fails when called
    /// in any state other than `Uninstalled`.
    pub async fn install(&mut self) -> Result<(), NftError> {
        self.require_state(TableState::Uninstalled, "install")?;

        let mut batch = Batch::new();
        batch.push(NftOp::CreateTable);

        batch.push(NftOp::AddSet {
            name: SET_BYPASS,
            key_type: "ipv4_addr",
            interval: true,
        });
        batch.push(NftOp::AddSet {
            name: SET_BYPASS6,
            key_type: "ipv6_addr",
            interval: true,
        });

        let (v4, v6): (Vec<&IpNet>, Vec<&IpNet>) =
            self.bypass.iter().partition(|net| matches!(net, IpNet::V4(_)));
        batch.push(NftOp::AddSetElements {
            set: SET_BYPASS,
            elements: v4.iter().map(|net| net.to_string()).collect(),
        });
        batch.push(NftOp::AddSetElements {
            set: SET_BYPASS6,
            elements: v6.iter().map(|net| net.to_string()).collect(),
        });

        batch.push(NftOp::AddMap {
            name: MAP_CGROUP,
            key_type: "typeof socket cgroupv2 level 1".into(),
        });
        batch.push(NftOp::AddMap {
            name: MAP_MARK,
            key_type: "type mark".into(),
        });
        batch.push(NftOp::AddMap {
            name: MAP_MARK_DNS,
            key_type: "type mark".into(),
        });

        batch.push(NftOp::AddChain {
            name: CHAIN_OUTPUT.into(),
            hook: Some(HookSpec {
                chain_type: "route",
                hook: "output",
                priority: "mangle",
            }),
        });
        Self::stage_output_rules(&mut batch, &BTreeSet::new());

        batch.push(NftOp::AddChain {
            name: CHAIN_PREROUTING.into(),
            hook: Some(HookSpec {
                chain_type: "filter",
                hook: "prerouting",
                priority: "mangle",
            }),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_PREROUTING.into(),
            expr: format!("ip daddr @{SET_BYPASS} accept"),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_PREROUTING.into(),
            expr: format!("ip6 daddr @{SET_BYPASS6} accept"),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_PREROUTING.into(),
            expr: format!("meta mark vmap @{MAP_MARK}"),
        });

        batch.push(NftOp::AddChain {
            name: CHAIN_NAT_OUTPUT.into(),
            hook: Some(HookSpec {
                chain_type: "nat",
                hook: "output",
                priority: "-100",
            }),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_NAT_OUTPUT.into(),
            expr: format!("meta mark vmap @{MAP_MARK_DNS}"),
        });

        self.connector.apply(&batch).await?;
        self.state = TableState::Installed;
        info!("installed base table with {} bypass prefixes", self.bypass.len());
        Ok(())
    }

    /// Install chains and mark-map entries for the given listeners.
    ///
    /// Idempotent against repeated calls: listeners already installed are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Fails on mark conflicts or when the table is not installed; batch
    /// rejection during setup is fatal.
    pub async fn add_listeners(
        &mut self,
        tproxies: &HashMap<String, TproxyConfig>,
    ) -> Result<(), NftError> {
        self.require_state(TableState::Installed, "add_listeners")?;

        // Deterministic staging order
        let ordered: BTreeMap<&String, &TproxyConfig> = tproxies.iter().collect();

        let mut batch = Batch::new();
        let mut added = Vec::new();
        for (name, config) in ordered {
            if self.listeners.contains_key(name.as_str()) {
                continue;
            }
            if self.listeners.values().any(|&mark| mark == config.mark) {
                return Err(NftError::DuplicateMark { mark: config.mark });
            }
            self.stage_listener(&mut batch, name, config);
            added.push((name.clone(), config.mark));
        }

        if batch.is_empty() {
            return Ok(());
        }

        self.connector.apply(&batch).await?;
        for (name, mark) in added {
            debug!("installed listener chain set for '{name}' (mark {mark:#x})");
            self.listeners.insert(name, mark);
        }
        Ok(())
    }

    /// Install a batch of cgroup routes.
    ///
    /// Resolves each cgroup directory to its inode, stages the verdict-map
    /// writes plus a full regeneration of the depth-ordered classification
    /// rules, and flushes everything as one transaction. An already-tracked
    /// path is silently replaced.
    ///
    /// # Errors
    ///
    /// A failed inode lookup fails the whole batch before anything is
    /// staged, and a rejected flush leaves the tracking map untouched, so
    /// tracked state never diverges from the kernel. Transient kernel
    /// resource exhaustion on flush is swallowed here (best-effort); other
    /// rejections are returned.
    pub async fn add_routes(&mut self, entries: &[(CgroupPath, Target)]) -> Result<(), NftError> {
        self.require_state(TableState::Installed, "add_routes")?;

        // Collapse duplicates within the batch (last one wins) and resolve
        // everything up front so a single failure aborts the whole call.
        let mut resolved: BTreeMap<CgroupPath, (u64, Verdict, Target)> = BTreeMap::new();
        for (path, target) in entries {
            let verdict = match self.verdict_for(target)? {
                Some(verdict) => verdict,
                None => continue,
            };
            let inode = self.resolve_inode(path)?;
            resolved.insert(path.clone(), (inode, verdict, target.clone()));
        }

        if resolved.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new();
        for (path, (inode, verdict, _)) in &resolved {
            if let Some(old) = self.routes.get(path) {
                batch.push(NftOp::DeleteMapElement {
                    map: MAP_CGROUP,
                    key: old.inode.to_string(),
                });
            }
            batch.push(NftOp::AddMapElement {
                map: MAP_CGROUP,
                key: inode.to_string(),
                verdict: verdict.clone(),
            });
        }

        let depths: BTreeSet<u32> = self
            .routes
            .keys()
            .chain(resolved.keys())
            .map(CgroupPath::depth)
            .collect();
        batch.push(NftOp::FlushChain {
            name: CHAIN_OUTPUT.into(),
        });
        Self::stage_output_rules(&mut batch, &depths);

        self.flush(&batch).await?;

        // Commit only after the kernel accepted the batch (or transiently
        // dropped it)
        for (path, (inode, _, target)) in resolved {
            debug!("route {path} (inode {inode}): {target}");
            self.routes.insert(path, RouteEntry { inode, target });
        }
        self.installed_depths = depths;
        Ok(())
    }

    /// Remove a batch of cgroup routes.
    ///
    /// Untracked paths are ignored. The classification rules are only
    /// regenerated when the set of distinct depths actually changed.
    ///
    /// # Errors
    ///
    /// A rejected flush leaves the tracking map untouched. Transient
    /// kernel resource exhaustion on flush is swallowed here; other
    /// rejections are returned.
    pub async fn remove_routes(&mut self, paths: &[CgroupPath]) -> Result<(), NftError> {
        self.require_state(TableState::Installed, "remove_routes")?;

        let unique: BTreeSet<&CgroupPath> = paths.iter().collect();

        let mut batch = Batch::new();
        let mut removed: BTreeSet<CgroupPath> = BTreeSet::new();
        for path in unique {
            if let Some(entry) = self.routes.get(path) {
                debug!("removing route {path} (inode {})", entry.inode);
                batch.push(NftOp::DeleteMapElement {
                    map: MAP_CGROUP,
                    key: entry.inode.to_string(),
                });
                removed.insert(path.clone());
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        let depths: BTreeSet<u32> = self
            .routes
            .keys()
            .filter(|path| !removed.contains(path))
            .map(CgroupPath::depth)
            .collect();
        if depths != self.installed_depths {
            batch.push(NftOp::FlushChain {
                name: CHAIN_OUTPUT.into(),
            });
            Self::stage_output_rules(&mut batch, &depths);
        }

        self.flush(&batch).await?;

        for path in removed {
            self.routes.remove(&path);
        }
        self.installed_depths = depths;
        Ok(())
    }

    /// Tear down the whole table in one transaction.
    ///
    /// Deleting an already-absent table is not an error, and calling
    /// `clear` again after teardown is a no-op. No other operation is
    /// valid afterwards.
    ///
    /// # Errors
    ///
    /// Returns `NftError` if the delete batch is rejected.
    pub async fn clear(&mut self) -> Result<(), NftError> {
        if self.state == TableState::TornDown {
            return Ok(());
        }

        let mut batch = Batch::new();
        batch.push(NftOp::DeleteTable);
        self.connector.apply(&batch).await?;

        self.routes.clear();
        self.listeners.clear();
        self.installed_depths.clear();
        self.state = TableState::TornDown;
        info!("table torn down");
        Ok(())
    }

    /// Release the connector session
    ///
    /// # Errors
    ///
    /// Returns `NftError` from the connector.
    pub async fn release(&mut self) -> Result<(), NftError> {
        self.connector.release().await
    }

    /// Whether a path is currently tracked
    #[must_use]
    pub fn is_tracked(&self, path: &CgroupPath) -> bool {
        self.routes.contains_key(path)
    }

    /// The currently tracked routes
    #[must_use]
    pub fn routes(&self) -> &HashMap<CgroupPath, RouteEntry> {
        &self.routes
    }

    /// Distinct depths among tracked routes
    #[must_use]
    pub fn tracked_depths(&self) -> BTreeSet<u32> {
        self.routes.keys().map(CgroupPath::depth).collect()
    }

    fn require_state(
        &self,
        expected: TableState,
        operation: &'static str,
    ) -> Result<(), NftError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NftError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    /// Map a target to its verdict; `None` means nothing to install
    fn verdict_for(&self, target: &Target) -> Result<Option<Verdict>, NftError> {
        match target.op {
            TargetOp::Noop => Ok(None),
            TargetOp::Direct => Ok(Some(Verdict::Accept)),
            TargetOp::Drop => Ok(Some(Verdict::Drop)),
            TargetOp::Tproxy => {
                let name = target.chain.as_deref().unwrap_or_default();
                if !self.listeners.contains_key(name) {
                    return Err(NftError::UnknownListener { name: name.into() });
                }
                Ok(Some(Verdict::Goto(mark_chain(name))))
            }
        }
    }

    /// Resolve a cgroup path to its directory inode via the live filesystem
    fn resolve_inode(&self, path: &CgroupPath) -> Result<u64, NftError> {
        let absolute = path.to_absolute(&self.cgroup_root);
        std::fs::metadata(&absolute)
            .map(|metadata| metadata.ino())
            .map_err(|source| NftError::CgroupGone {
                path: path.clone(),
                source,
            })
    }

    /// Stage the output chain's rules: the static guards followed by one
    /// classification rule per distinct depth, deepest first. The ordering
    /// is load-bearing: evaluation is first-match, so a deep cgroup's own
    /// entry must be consulted before any shallower ancestor's.
    fn stage_output_rules(batch: &mut Batch, depths: &BTreeSet<u32>) {
        batch.push(NftOp::AddRule {
            chain: CHAIN_OUTPUT.into(),
            expr: "ct direction reply return".into(),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_OUTPUT.into(),
            expr: format!("ip daddr @{SET_BYPASS} return"),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_OUTPUT.into(),
            expr: format!("ip6 daddr @{SET_BYPASS6} return"),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_OUTPUT.into(),
            expr: "meta l4proto != { tcp, udp } return".into(),
        });

        for depth in depths.iter().rev() {
            batch.push(NftOp::AddRule {
                chain: CHAIN_OUTPUT.into(),
                expr: format!("socket cgroupv2 level {depth} vmap @{MAP_CGROUP}"),
            });
        }
    }

    /// Stage the chain triple and mark-map entries for one listener
    fn stage_listener(&self, batch: &mut Batch, name: &str, config: &TproxyConfig) {
        let mark = format!("{:#x}", config.mark);

        // <name>-mark: stamp the listener's dedicated fwmark; the route
        // hook then re-evaluates the marked packet through policy routing
        let mark_chain = mark_chain(name);
        batch.push(NftOp::AddChain {
            name: mark_chain.clone(),
            hook: None,
        });
        batch.push(NftOp::AddRule {
            chain: mark_chain,
            expr: format!("meta mark set {mark}"),
        });

        // <name>: the actual TPROXY redirect, dispatched by mark from
        // prerouting
        batch.push(NftOp::AddChain {
            name: name.into(),
            hook: None,
        });
        if !config.allow_ipv6 {
            batch.push(NftOp::AddRule {
                chain: name.into(),
                expr: "meta nfproto ipv6 return".into(),
            });
        }
        let proto = if config.allow_udp {
            "meta l4proto { tcp, udp }"
        } else {
            "meta l4proto tcp"
        };
        batch.push(NftOp::AddRule {
            chain: name.into(),
            expr: format!("{proto} tproxy to :{} accept", config.port),
        });
        batch.push(NftOp::AddMapElement {
            map: MAP_MARK,
            key: mark.clone(),
            verdict: Verdict::Goto(name.into()),
        });

        // <name>-dns: NAT port-53 traffic to the configured resolver
        if let Some(dns) = &config.dns_hijack {
            let dns_chain = dns_chain(name);
            let (family, endpoint) = if dns.ip.is_ipv4() {
                ("ip", format!("{}:{}", dns.ip, dns.port))
            } else {
                ("ip6", format!("[{}]:{}", dns.ip, dns.port))
            };
            batch.push(NftOp::AddChain {
                name: dns_chain.clone(),
                hook: None,
            });
            batch.push(NftOp::AddRule {
                chain: dns_chain.clone(),
                expr: format!("udp dport 53 dnat {family} to {endpoint}"),
            });
            if dns.hijack_tcp {
                batch.push(NftOp::AddRule {
                    chain: dns_chain.clone(),
                    expr: format!("tcp dport 53 dnat {family} to {endpoint}"),
                });
            }
            batch.push(NftOp::AddMapElement {
                map: MAP_MARK_DNS,
                key: mark,
                verdict: Verdict::Goto(dns_chain),
            });
        }
    }

    /// The compiler's flush wrapper: the one layer where transient kernel
    /// resource exhaustion is recognized and swallowed. The attempted
    /// change may have been dropped by the kernel; it is not retried.
    async fn flush(&mut self, batch: &Batch) -> Result<(), NftError> {
        match self.connector.apply(batch).await {
            Err(e) if e.is_transient() => {
                warn!("flush hit kernel resource exhaustion, change may be lost: {e}");
                Ok(())
            }
            other => other,
        }
    }
}
