//! Network layer for Geofetch
//!
//! Per-host persistent connections with bounded capacity and a one-way
//! liveness switch shared by every wait in the crate.

mod connection_pool;
mod connector;
mod host;
mod liveness;
#[cfg(test)]
pub(crate) mod mock;
mod stack;

pub use connection_pool::{ConnectionPool, PoolStats, PooledConnection};
pub use connector::{
    Connector, HttpConnection, HttpConnector, OutboundRequest, RawResponse, Transport,
};
pub use host::{HostKey, Scheme, Target};
pub use liveness::Liveness;

pub(crate) use stack::LifoStack;

/// Default number of workers and of connections kept per host
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Timeout for loopback hosts, where slow local services are expected
pub const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 600;

/// Timeout for remote hosts
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 15;
