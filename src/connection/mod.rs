pub mod config;
pub mod pool;
pub mod uri;

pub use config::ConnectionConfig;
pub use pool::{ConnectionId, ConnectionPool, HandleState, Lease, PoolStats};
