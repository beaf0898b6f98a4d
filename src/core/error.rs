use crate::connection::pool::ConnectionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection pool exhausted: all {capacity} connections are in use")]
    PoolExhausted { capacity: usize },

    #[error("Invalid release: connection {0} is not in use")]
    InvalidRelease(ConnectionId),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
