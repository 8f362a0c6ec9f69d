//! Firewall table synthesis
//!
//! Everything that turns forwarding decisions into kernel state lives
//! here: typed staged operations ([`ops`]), the transactional session to
//! the kernel ([`connector`]) and the stateful [`compiler`] that owns the
//! table's full lifecycle.

mod compiler;
mod connector;
mod error;
mod ops;

pub use compiler::{PolicyCompiler, RouteEntry, Target, TargetOp};
pub use connector::{Connector, NftCliConnector, RecordingConnector};
pub use error::NftError;
pub use ops::{
    Batch, HookSpec, NftOp, Verdict, CHAIN_NAT_OUTPUT, CHAIN_OUTPUT, CHAIN_PREROUTING, MAP_CGROUP,
    MAP_MARK, MAP_MARK_DNS, SET_BYPASS, SET_BYPASS6, TABLE_FAMILY, TABLE_NAME,
};
