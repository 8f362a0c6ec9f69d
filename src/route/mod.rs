//! Route management
//!
//! Turns the monitor's cgroup lifecycle events into firewall state: the
//! [`RouteMatcher`] resolves paths to forwarding decisions, the
//! [`PolicyRouting`] handle installs the fwmark loopback rules TPROXY
//! needs, and the [`RouteManager`] wires everything to the policy
//! compiler.

mod error;
mod manager;
mod matcher;
mod policy;

pub use error::RouteError;
pub use manager::RouteManager;
pub use matcher::RouteMatcher;
pub use policy::PolicyRouting;
