//! Configuration types for cgtproxy
//!
//! This module defines all configuration structures used by the control
//! plane. Configuration is loaded from JSON files and validated at startup;
//! the core components receive it as an immutable, already-validated
//! structure.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default capacity of the monitor's event channel
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Default policy-routing table number
pub const DEFAULT_ROUTE_TABLE: u32 = 300;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Path to the cgroup-v2 filesystem root to monitor
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Routing table number used to loop marked packets back through
    /// the firewall (`ip rule` / `ip route` target)
    #[serde(default = "default_route_table")]
    pub route_table: u32,

    /// Destination prefixes that must never be marked or intercepted.
    /// Bare addresses are accepted and treated as host prefixes.
    #[serde(default)]
    pub bypass: Vec<String>,

    /// Named TPROXY listener definitions
    #[serde(default)]
    pub tproxies: HashMap<String, TproxyConfig>,

    /// Ordered routing rules; first match wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Cgroup monitor tuning
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

const fn default_route_table() -> u32 {
    DEFAULT_ROUTE_TABLE
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cgroup_root.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "cgroup_root must be an absolute path: {}",
                self.cgroup_root.display()
            )));
        }

        if self.route_table == 0 || self.route_table > 0xFFFF_FFFE {
            return Err(ConfigError::ValidationError(format!(
                "route_table out of range: {}",
                self.route_table
            )));
        }

        for entry in &self.bypass {
            parse_bypass(entry).map_err(|e| {
                ConfigError::ValidationError(format!("invalid bypass entry '{entry}': {e}"))
            })?;
        }

        let mut marks: HashSet<u32> = HashSet::new();
        for (name, tproxy) in &self.tproxies {
            tproxy.validate(name)?;
            if !marks.insert(tproxy.mark) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate fwmark {:#x} (listener '{name}')",
                    tproxy.mark
                )));
            }
        }

        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate(index, &self.tproxies)?;
        }

        self.monitor.validate()?;

        Ok(())
    }

    /// Parse the configured bypass entries into IP prefixes.
    ///
    /// Only meaningful after [`Config::validate`] succeeded; entries that
    /// fail to parse here are skipped (validation already rejected them).
    #[must_use]
    pub fn bypass_prefixes(&self) -> Vec<IpNet> {
        self.bypass
            .iter()
            .filter_map(|entry| parse_bypass(entry).ok())
            .collect()
    }
}

/// Parse a bypass entry: either a CIDR prefix or a bare address
fn parse_bypass(entry: &str) -> Result<IpNet, String> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| e.to_string())
}

/// A single TPROXY listener definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TproxyConfig {
    /// Local port the TPROXY listener is bound to
    pub port: u16,

    /// Dedicated fwmark used to dispatch packets to this listener's chain.
    /// Must be unique across listeners and non-zero.
    pub mark: u32,

    /// Whether UDP traffic is intercepted (TCP only when false)
    #[serde(default = "default_true")]
    pub allow_udp: bool,

    /// Whether IPv6 traffic is intercepted (IPv4 only when false)
    #[serde(default = "default_true")]
    pub allow_ipv6: bool,

    /// Optional DNS hijacking: rewrite port-53 traffic to this resolver
    #[serde(default)]
    pub dns_hijack: Option<DnsHijackConfig>,
}

const fn default_true() -> bool {
    true
}

impl TproxyConfig {
    /// Validate a single listener definition
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on invalid name, port or mark.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::ValidationError(format!(
                "listener name must be non-empty alphanumeric/hyphen/underscore: '{name}'"
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "listener '{name}': port must be non-zero"
            )));
        }
        if self.mark == 0 {
            return Err(ConfigError::ValidationError(format!(
                "listener '{name}': fwmark must be non-zero"
            )));
        }
        if let Some(dns) = &self.dns_hijack {
            if dns.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "listener '{name}': dns_hijack port must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

/// DNS hijack settings for a TPROXY listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsHijackConfig {
    /// Address of the resolver that captures hijacked queries
    pub ip: IpAddr,

    /// Resolver port
    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// Also hijack TCP port 53 (UDP is always hijacked)
    #[serde(default)]
    pub hijack_tcp: bool,
}

const fn default_dns_port() -> u16 {
    53
}

/// A single routing rule: cgroup path pattern plus forwarding decision
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    /// Regex matched against the normalized cgroup path (e.g. `^/app1`)
    #[serde(rename = "match")]
    pub pattern: String,

    /// Forwarding decision applied on match
    pub decision: DecisionConfig,
}

impl RuleConfig {
    fn validate(
        &self,
        index: usize,
        tproxies: &HashMap<String, TproxyConfig>,
    ) -> Result<(), ConfigError> {
        regex::Regex::new(&self.pattern).map_err(|e| {
            ConfigError::ValidationError(format!("rule #{index}: invalid pattern: {e}"))
        })?;

        if let DecisionConfig::Tproxy(name) = &self.decision {
            if !tproxies.contains_key(name) {
                return Err(ConfigError::ValidationError(format!(
                    "rule #{index}: unknown tproxy listener '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Forwarding decision kinds available to rules
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionConfig {
    /// Redirect to the named TPROXY listener
    Tproxy(String),
    /// Drop all traffic from the cgroup
    Drop,
    /// Accept as-is, stop further classification
    Direct,
}

/// Cgroup monitor tuning knobs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Capacity of the event channel between monitor and route manager.
    /// Events beyond this buffer are dropped under sustained overload
    /// (best-effort delivery).
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

const fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.event_buffer must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include module targets in log output
    #[serde(default)]
    pub target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}
