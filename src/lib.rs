// ============================================================================
// docsync Library
// ============================================================================
//
// Streams documents out of a document store in fixed-size windows, feeds each
// one to a user handler, and writes results back under change detection and
// dry-run rules. Independent tasks run concurrently over a bounded pool of
// store connections.

pub mod core;
pub mod connection;
pub mod facade;
pub mod interface;
pub mod storage;
pub mod sync;

// Re-export main types for convenience
pub use core::{Namespace, Record, Result, SyncError};
pub use facade::SyncEngine;
pub use interface::{DocumentStore, StoreConnector};

// Re-export connection API
pub use connection::{
    ConnectionConfig,
    pool::{ConnectionId, ConnectionPool, Lease, PoolStats},
};

pub use sync::{
    DispatchReport, DryRun, SaveReport, SaveRequest, SyncConfig, SyncContext, SyncHandler,
    TaskBinding, TaskStatus, UpsertEngine, handler_fn,
};
