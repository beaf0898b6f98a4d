use crate::connection::{ConnectionConfig, ConnectionPool};
use crate::core::Result;
use crate::interface::StoreConnector;
use crate::sync::{
    DEFAULT_DRY_RUN_PACING, DispatchReport, Dispatcher, DryRun, SyncConfig, SyncHandler,
    TaskBinding, TaskRegistry, UpsertEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Batch sync engine
///
/// Owns the connection pool and the task registry. Register tasks, optionally
/// switch on dry-run, then `run`.
///
/// # Examples
///
/// ```
/// use docsync::{ConnectionConfig, SyncEngine};
/// use docsync::storage::MemoryStore;
/// use docsync::sync::handler_fn;
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let mut engine = SyncEngine::new(ConnectionConfig::default(), store.connector()).unwrap();
///
/// let handler = handler_fn("noop", |_record, _ctx| async { Ok(()) });
/// engine.add_task(handler, "db", "col").unwrap();
///
/// let report = engine.run(3).await.unwrap();
/// assert_eq!(report.failed(), 0);
/// # });
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    pool: Arc<ConnectionPool>,
    registry: TaskRegistry,
}

impl SyncEngine {
    /// Create an engine with default settings
    pub fn new(connection: ConnectionConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        Self::with_config(connection, SyncConfig::default(), connector)
    }

    pub fn with_config(
        connection: ConnectionConfig,
        config: SyncConfig,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(connection, connector)?;

        Ok(Self {
            config,
            pool: Arc::new(pool),
            registry: TaskRegistry::new(),
        })
    }

    /// A binding for `store.collection` using the engine's batch size
    pub fn binding(&self, store: &str, collection: &str) -> TaskBinding {
        TaskBinding::new(store, collection).batch_size(self.config.batch_size)
    }

    /// Register `handler` under `binding`, replacing any earlier binding of the same handler
    pub fn register(&mut self, handler: Arc<dyn SyncHandler>, binding: TaskBinding) -> Result<()> {
        let name = handler.name().to_string();
        let replaced = self.registry.register(handler, binding.clone())?;

        info!(
            "{} task {}@{}",
            if replaced { "replaced" } else { "registered" },
            name,
            binding.ns
        );
        debug!("binding for {}: {:?}", name, binding);
        Ok(())
    }

    /// Register `handler` over every document of `store.collection`
    pub fn add_task(
        &mut self,
        handler: Arc<dyn SyncHandler>,
        store: &str,
        collection: &str,
    ) -> Result<()> {
        let binding = self.binding(store, collection);
        self.register(handler, binding)
    }

    /// Compute and log writes without applying them, pausing `pacing` after each record
    pub fn enable_dry_run(&mut self, pacing: Duration) {
        info!("dry run enabled: the store will not be modified");
        self.config.dry_run = DryRun::enabled(pacing);
    }

    /// [`enable_dry_run`](Self::enable_dry_run) with the default one second pacing
    pub fn enable_dry_run_default(&mut self) {
        self.enable_dry_run(DEFAULT_DRY_RUN_PACING);
    }

    pub fn dry_run(&self) -> DryRun {
        self.config.dry_run
    }

    /// An upsert engine sharing the engine's dry-run setting
    pub fn upsert_engine(&self) -> UpsertEngine {
        UpsertEngine::new(self.config.dry_run)
    }

    /// Run every registered task on `worker_count` workers and wait for all of
    /// them. Individual task failures are reported, not returned as errors.
    pub async fn run(&self, worker_count: usize) -> Result<DispatchReport> {
        Dispatcher::new(Arc::clone(&self.pool), self.config.dry_run)
            .run(&self.registry, worker_count)
            .await
    }

    /// [`run`](Self::run) with the configured worker count
    pub async fn run_default(&self) -> Result<DispatchReport> {
        self.run(self.config.workers).await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Namespace, Record};
    use crate::storage::MemoryStore;
    use crate::sync::handler_fn;

    #[test]
    fn test_binding_uses_configured_batch_size() {
        let store = MemoryStore::new();
        let engine = SyncEngine::with_config(
            ConnectionConfig::default(),
            SyncConfig::new().batch_size(25),
            store.connector(),
        )
        .unwrap();

        assert_eq!(engine.binding("db", "col").batch_size, 25);
    }

    #[test]
    fn test_invalid_settings_fail_construction() {
        let store = MemoryStore::new();
        assert!(
            SyncEngine::with_config(
                ConnectionConfig::default(),
                SyncConfig::new().workers(0),
                store.connector()
            )
            .is_err()
        );
        let no_capacity = ConnectionConfig::default().max_connections(0);
        assert!(SyncEngine::new(no_capacity, store.connector()).is_err());
    }

    #[test]
    fn test_register_replaces_same_handler() {
        let store = MemoryStore::new();
        let mut engine = SyncEngine::new(ConnectionConfig::default(), store.connector()).unwrap();
        let handler: Arc<dyn SyncHandler> = handler_fn("h", |_r, _c| async { Ok(()) });

        engine.add_task(Arc::clone(&handler), "db", "a").unwrap();
        engine.add_task(Arc::clone(&handler), "db", "b").unwrap();

        assert_eq!(engine.registry().len(), 1);
        assert_eq!(
            engine.registry().binding(&handler).map(|b| b.ns.clone()),
            Some(Namespace::new("db", "b"))
        );
    }

    #[tokio::test]
    async fn test_run_default_uses_config_workers() {
        let store = MemoryStore::new();
        store.seed(&Namespace::new("db", "col"), (0..3).map(|i| Record::new().with("n", i)));
        let mut engine = SyncEngine::new(ConnectionConfig::default(), store.connector()).unwrap();
        engine
            .add_task(handler_fn("h", |_r, _c| async { Ok(()) }), "db", "col")
            .unwrap();

        let report = engine.run_default().await.unwrap();
        assert_eq!(report.processed(), 3);
    }

    #[test]
    fn test_enable_dry_run() {
        let store = MemoryStore::new();
        let mut engine = SyncEngine::new(ConnectionConfig::default(), store.connector()).unwrap();
        assert!(!engine.dry_run().enabled);

        engine.enable_dry_run(Duration::from_millis(5));
        assert!(engine.dry_run().enabled);
        assert!(engine.upsert_engine().dry_run().enabled);
    }

    #[test]
    fn test_enable_dry_run_default_pacing() {
        let store = MemoryStore::new();
        let mut engine = SyncEngine::new(ConnectionConfig::default(), store.connector()).unwrap();

        engine.enable_dry_run_default();
        assert_eq!(engine.dry_run().pacing_delay(), Some(Duration::from_secs(1)));
    }
}
