use super::config::ConnectionConfig;
use super::uri;
use crate::core::{Result, SyncError};
use crate::interface::{DocumentStore, StoreConnector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque identity of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    InUse,
}

/// A live connection owned by the pool
struct ConnectionHandle {
    client: Arc<dyn DocumentStore>,
    state: HandleState,
    created_at: Instant,
}

/// Partitions guarded by the pool lock.
///
/// `idle` and `in_use` are disjoint and both are subsets of `handles`.
#[derive(Default)]
struct PoolState {
    handles: HashMap<ConnectionId, ConnectionHandle>,
    idle: VecDeque<ConnectionId>,
    in_use: HashSet<ConnectionId>,
}

/// Connection pool
///
/// Creates store sessions on demand up to `max_connections` and tracks each one
/// as idle or in use. Every operation runs under one lock, so concurrent workers
/// never observe or produce a half-moved handle.
pub struct ConnectionPool {
    config: ConnectionConfig,
    endpoint: String,
    connector: Arc<dyn StoreConnector>,
    state: Mutex<PoolState>,
}

/// An acquired connection
#[derive(Clone)]
pub struct Lease {
    id: ConnectionId,
    client: Arc<dyn DocumentStore>,
}

impl Lease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.client)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened lazily by [`acquire`](Self::acquire).
    pub fn new(config: ConnectionConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        info!(
            "{}: pool ready for {} (max {} connections)",
            config.name,
            uri::mask_password(&endpoint),
            config.max_connections
        );

        Ok(Self {
            config,
            endpoint,
            connector,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.max_connections
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Take an idle connection, opening a new one first if none is idle and
    /// the pool is below capacity.
    ///
    /// The oldest idle connection is handed out first.
    pub async fn acquire(&self) -> Result<Lease> {
        let mut state = self.state.lock().await;

        if state.idle.is_empty() && state.handles.len() < self.config.max_connections {
            self.open_connection(&mut state).await?;
        }

        let id = state.idle.pop_front().ok_or(SyncError::PoolExhausted {
            capacity: self.config.max_connections,
        })?;

        let handle = state.handles.get_mut(&id).ok_or_else(|| {
            SyncError::ExecutionError(format!("idle connection {} has no handle", id))
        })?;
        handle.state = HandleState::InUse;
        let client = Arc::clone(&handle.client);
        state.in_use.insert(id);

        debug!("{}: connection {} -> in use", self.config.name, id);
        Ok(Lease { id, client })
    }

    /// Like [`acquire`](Self::acquire), but waits for a connection to free up
    /// while the pool is exhausted, for at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease> {
        let start = Instant::now();

        loop {
            match self.acquire().await {
                Err(SyncError::PoolExhausted { capacity }) => {
                    if start.elapsed() > timeout {
                        warn!(
                            "{}: no connection freed up within {:?}",
                            self.config.name, timeout
                        );
                        return Err(SyncError::PoolExhausted { capacity });
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => return other,
            }
        }
    }

    /// Return an in-use connection to the idle partition
    pub async fn release(&self, id: ConnectionId) -> Result<()> {
        let mut state = self.state.lock().await;

        if !state.in_use.remove(&id) {
            warn!("{}: release of connection {} which is not in use", self.config.name, id);
            return Err(SyncError::InvalidRelease(id));
        }

        if let Some(handle) = state.handles.get_mut(&id) {
            handle.state = HandleState::Idle;
        }
        state.idle.push_back(id);

        debug!("{}: connection {} -> idle", self.config.name, id);
        Ok(())
    }

    /// Drop a connection from the pool and close it.
    ///
    /// Destroying an unknown id is a no-op. Returns whether a connection was removed.
    pub async fn destroy(&self, id: ConnectionId) -> bool {
        let handle = {
            let mut state = self.state.lock().await;
            state.idle.retain(|idle| *idle != id);
            state.in_use.remove(&id);
            state.handles.remove(&id)
        };

        match handle {
            Some(handle) => {
                if let Err(err) = handle.client.close().await {
                    warn!("{}: closing connection {} failed: {}", self.config.name, id, err);
                }
                info!(
                    "{}: connection {} destroyed after {:?}",
                    self.config.name,
                    id,
                    handle.created_at.elapsed()
                );
                true
            }
            None => {
                info!("{}: connection {} does not exist", self.config.name, id);
                false
            }
        }
    }

    pub async fn state_of(&self, id: ConnectionId) -> Option<HandleState> {
        let state = self.state.lock().await;
        state.handles.get(&id).map(|handle| handle.state)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.state.lock().await.handles.contains_key(&id)
    }

    pub async fn idle_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.idle.iter().copied().collect()
    }

    pub async fn in_use_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.in_use.iter().copied().collect()
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;

        PoolStats {
            total_connections: state.handles.len(),
            idle_connections: state.idle.len(),
            in_use_connections: state.in_use.len(),
            max_connections: self.config.max_connections,
        }
    }

    async fn open_connection(&self, state: &mut PoolState) -> Result<ConnectionId> {
        let client = self.connector.connect(&self.endpoint).await.map_err(|err| {
            warn!("{}: opening connection failed: {}", self.config.name, err);
            match err {
                SyncError::ConnectionError(msg) => SyncError::ConnectionError(msg),
                other => SyncError::ConnectionError(other.to_string()),
            }
        })?;

        let mut id = ConnectionId::generate();
        while state.handles.contains_key(&id) {
            id = ConnectionId::generate();
        }

        state.handles.insert(
            id,
            ConnectionHandle {
                client,
                state: HandleState::Idle,
                created_at: Instant::now(),
            },
        );
        state.idle.push_back(id);

        info!("{}: opened connection {}", self.config.name, id);
        Ok(id)
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub in_use_connections: usize,
    pub max_connections: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} idle, max {}",
            self.in_use_connections,
            self.total_connections,
            self.idle_connections,
            self.max_connections
        )
    }
}
