//! Configuration types and loading
//!
//! The control plane consumes configuration as a finished, validated
//! structure: [`load_config`] parses a JSON file, fills in defaults and
//! runs [`Config::validate`] before anything else is constructed.

mod loader;
mod types;

pub use loader::{create_default_config, load_config};
pub use types::{
    Config, DecisionConfig, DnsHijackConfig, LogConfig, MonitorConfig, RuleConfig, TproxyConfig,
    DEFAULT_EVENT_BUFFER, DEFAULT_ROUTE_TABLE,
};
