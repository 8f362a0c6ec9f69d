//! Staged nftables operations
//!
//! The policy compiler never talks to the kernel directly; it stages typed
//! operations into a [`Batch`] and hands the batch to a
//! [`Connector`](super::Connector), which applies it as one transaction.
//! Batches render deterministically to `nft -f` script text, which is also
//! what the tests assert against.

use std::fmt;
use std::fmt::Write as _;

/// Name of the one table owned by this process
pub const TABLE_NAME: &str = "cgtproxy";

/// Address family of the table
pub const TABLE_FAMILY: &str = "inet";

/// IPv4 bypass prefix set
pub const SET_BYPASS: &str = "bypass";

/// IPv6 bypass prefix set
pub const SET_BYPASS6: &str = "bypass6";

/// Verdict map: cgroup inode -> forwarding verdict
pub const MAP_CGROUP: &str = "cgroup-vmap";

/// Verdict map: fwmark -> TPROXY listener chain
pub const MAP_MARK: &str = "mark-vmap";

/// Verdict map: fwmark -> DNS hijack chain
pub const MAP_MARK_DNS: &str = "mark-dns-vmap";

/// Output-stage classification chain
pub const CHAIN_OUTPUT: &str = "output";

/// Pre-routing TPROXY dispatch chain
pub const CHAIN_PREROUTING: &str = "prerouting";

/// NAT-stage output chain for DNS hijacking
pub const CHAIN_NAT_OUTPUT: &str = "nat-output";

/// A kernel verdict as used in verdict maps and rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Accept the packet, stop classification
    Accept,
    /// Drop the packet
    Drop,
    /// Return to the calling chain
    Return,
    /// Jump to a chain (evaluation returns afterwards)
    Jump(String),
    /// Go to a chain (evaluation does not return)
    Goto(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Drop => f.write_str("drop"),
            Self::Return => f.write_str("return"),
            Self::Jump(chain) => write!(f, "jump {chain}"),
            Self::Goto(chain) => write!(f, "goto {chain}"),
        }
    }
}

/// Base-chain hook attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    /// Chain type: `route`, `filter` or `nat`
    pub chain_type: &'static str,
    /// Netfilter hook: `output`, `prerouting`, ...
    pub hook: &'static str,
    /// Hook priority, nft keyword or number
    pub priority: &'static str,
}

/// One staged operation against the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NftOp {
    /// Declare the table
    CreateTable,
    /// Delete the table; rendered idempotently (declare-then-delete), so
    /// deleting an absent table is not an error
    DeleteTable,
    /// Declare a named set
    AddSet {
        name: &'static str,
        key_type: &'static str,
        interval: bool,
    },
    /// Add elements to a named set
    AddSetElements {
        set: &'static str,
        elements: Vec<String>,
    },
    /// Declare a verdict map
    AddMap {
        name: &'static str,
        key_type: String,
    },
    /// Add one element to a verdict map
    AddMapElement {
        map: &'static str,
        key: String,
        verdict: Verdict,
    },
    /// Delete one element from a verdict map
    DeleteMapElement { map: &'static str, key: String },
    /// Declare a chain, optionally attached to a hook
    AddChain {
        name: String,
        hook: Option<HookSpec>,
    },
    /// Flush all rules from a chain
    FlushChain { name: String },
    /// Append a rule to a chain
    AddRule { chain: String, expr: String },
}

impl NftOp {
    /// Render this operation as one or more `nft -f` script lines
    fn render_into(&self, out: &mut String) {
        let table = format!("{TABLE_FAMILY} {TABLE_NAME}");
        match self {
            Self::CreateTable => {
                let _ = writeln!(out, "add table {table}");
            }
            Self::DeleteTable => {
                // Declaring first makes the delete idempotent
                let _ = writeln!(out, "add table {table}");
                let _ = writeln!(out, "delete table {table}");
            }
            Self::AddSet {
                name,
                key_type,
                interval,
            } => {
                let flags = if *interval { " flags interval;" } else { "" };
                let _ = writeln!(out, "add set {table} {name} {{ type {key_type};{flags} }}");
            }
            Self::AddSetElements { set, elements } => {
                if !elements.is_empty() {
                    let _ = writeln!(out, "add element {table} {set} {{ {} }}", elements.join(", "));
                }
            }
            Self::AddMap { name, key_type } => {
                let _ = writeln!(out, "add map {table} {name} {{ {key_type} : verdict; }}");
            }
            Self::AddMapElement { map, key, verdict } => {
                let _ = writeln!(out, "add element {table} {map} {{ {key} : {verdict} }}");
            }
            Self::DeleteMapElement { map, key } => {
                let _ = writeln!(out, "delete element {table} {map} {{ {key} }}");
            }
            Self::AddChain { name, hook } => match hook {
                Some(spec) => {
                    let _ = writeln!(
                        out,
                        "add chain {table} {name} {{ type {} hook {} priority {}; policy accept; }}",
                        spec.chain_type, spec.hook, spec.priority
                    );
                }
                None => {
                    let _ = writeln!(out, "add chain {table} {name}");
                }
            },
            Self::FlushChain { name } => {
                let _ = writeln!(out, "flush chain {table} {name}");
            }
            Self::AddRule { chain, expr } => {
                let _ = writeln!(out, "add rule {table} {chain} {expr}");
            }
        }
    }
}

/// An ordered sequence of operations applied as one kernel transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<NftOp>,
}

impl Batch {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage one operation
    pub fn push(&mut self, op: NftOp) {
        self.ops.push(op);
    }

    /// Whether the batch stages nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of staged operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The staged operations, in order
    #[must_use]
    pub fn ops(&self) -> &[NftOp] {
        &self.ops
    }

    /// Render the whole batch as an `nft -f` script
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            op.render_into(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accept.to_string(), "accept");
        assert_eq!(Verdict::Drop.to_string(), "drop");
        assert_eq!(Verdict::Goto("t1-mark".into()).to_string(), "goto t1-mark");
    }

    #[test]
    fn test_render_table_lifecycle() {
        let mut batch = Batch::new();
        batch.push(NftOp::CreateTable);
        batch.push(NftOp::DeleteTable);

        let script = batch.render();
        assert_eq!(
            script,
            "add table inet cgtproxy\n\
             add table inet cgtproxy\n\
             delete table inet cgtproxy\n"
        );
    }

    #[test]
    fn test_render_set_and_elements() {
        let mut batch = Batch::new();
        batch.push(NftOp::AddSet {
            name: SET_BYPASS,
            key_type: "ipv4_addr",
            interval: true,
        });
        batch.push(NftOp::AddSetElements {
            set: SET_BYPASS,
            elements: vec!["127.0.0.0/8".into(), "10.0.0.0/8".into()],
        });

        let script = batch.render();
        assert!(script.contains("add set inet cgtproxy bypass { type ipv4_addr; flags interval; }"));
        assert!(script.contains("add element inet cgtproxy bypass { 127.0.0.0/8, 10.0.0.0/8 }"));
    }

    #[test]
    fn test_empty_elements_render_nothing() {
        let mut batch = Batch::new();
        batch.push(NftOp::AddSetElements {
            set: SET_BYPASS6,
            elements: vec![],
        });
        assert!(batch.render().is_empty());
    }

    #[test]
    fn test_render_map_element() {
        let mut batch = Batch::new();
        batch.push(NftOp::AddMapElement {
            map: MAP_CGROUP,
            key: "4242".into(),
            verdict: Verdict::Goto("t1-mark".into()),
        });
        batch.push(NftOp::DeleteMapElement {
            map: MAP_CGROUP,
            key: "4242".into(),
        });

        let script = batch.render();
        assert!(script.contains("add element inet cgtproxy cgroup-vmap { 4242 : goto t1-mark }"));
        assert!(script.contains("delete element inet cgtproxy cgroup-vmap { 4242 }"));
    }

    #[test]
    fn test_render_hooked_chain() {
        let mut batch = Batch::new();
        batch.push(NftOp::AddChain {
            name: CHAIN_OUTPUT.into(),
            hook: Some(HookSpec {
                chain_type: "route",
                hook: "output",
                priority: "mangle",
            }),
        });
        batch.push(NftOp::AddRule {
            chain: CHAIN_OUTPUT.into(),
            expr: "ct direction reply return".into(),
        });

        let script = batch.render();
        assert!(script.contains(
            "add chain inet cgtproxy output { type route hook output priority mangle; policy accept; }"
        ));
        assert!(script.contains("add rule inet cgtproxy output ct direction reply return"));
    }
}
