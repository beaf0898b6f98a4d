//! Sync tasks: the handler capability, its binding, and the registry
//!
//! A task is a [`SyncHandler`] plus the [`TaskBinding`] describing which
//! documents it is fed. Handlers receive each document along with a
//! [`SyncContext`] holding the connection bound to the task for its run.

use super::settings::{DEFAULT_BATCH_SIZE, DryRun};
use super::upsert::{SaveReport, SaveRequest, UpsertEngine};
use crate::core::{Namespace, Record, Result, SyncError};
use crate::interface::DocumentStore;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Per-document processing step supplied by the user
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn process(&self, record: Record, ctx: &SyncContext) -> anyhow::Result<()>;

    /// Label used in logs and reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into a [`SyncHandler`]
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap `f` as a handler.
///
/// # Examples
///
/// ```
/// use docsync::sync::{handler_fn, SaveRequest};
///
/// let copy = handler_fn("copy", |record, ctx| async move {
///     let target = docsync::Namespace::new("db", "archive");
///     ctx.save(SaveRequest::new(target, record)).await;
///     Ok(())
/// });
/// # let _ = copy;
/// ```
pub fn handler_fn<F, Fut>(name: &str, f: F) -> Arc<FnHandler<F, Fut>>
where
    F: Fn(Record, SyncContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        f,
        _fut: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> SyncHandler for FnHandler<F, Fut>
where
    F: Fn(Record, SyncContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, record: Record, ctx: &SyncContext) -> anyhow::Result<()> {
        (self.f)(record, ctx.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// What a handler sees besides the document
#[derive(Clone)]
pub struct SyncContext {
    ns: Namespace,
    store: Arc<dyn DocumentStore>,
    dry_run: DryRun,
    params: Arc<Record>,
}

impl SyncContext {
    pub fn new(
        ns: Namespace,
        store: Arc<dyn DocumentStore>,
        dry_run: DryRun,
        params: Record,
    ) -> Self {
        Self {
            ns,
            store,
            dry_run,
            params: Arc::new(params),
        }
    }

    /// Collection the task reads from
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Connection bound to the task
    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn dry_run(&self) -> DryRun {
        self.dry_run
    }

    /// Extra parameter registered with the binding
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// An upsert engine honoring the engine's dry-run setting
    pub fn upsert_engine(&self) -> UpsertEngine {
        UpsertEngine::new(self.dry_run)
    }

    /// Save through the task's connection
    pub async fn save(&self, request: SaveRequest) -> SaveReport {
        self.upsert_engine().save(self.store(), request).await
    }
}

/// Which documents a task is fed, and how
#[derive(Clone)]
pub struct TaskBinding {
    pub ns: Namespace,
    pub filter: Record,
    /// Stop after this many records; 0 means no limit
    pub limit: u64,
    pub batch_size: u64,
    /// Offset of the first window
    pub start: u64,
    /// Connection supplied by the caller. When set, the pool is bypassed and
    /// the connection is never closed by the engine.
    pub override_connection: Option<Arc<dyn DocumentStore>>,
    pub params: Record,
}

impl TaskBinding {
    pub fn new(store: &str, collection: &str) -> Self {
        Self {
            ns: Namespace::new(store, collection),
            filter: Record::new(),
            limit: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            start: 0,
            override_connection: None,
            params: Record::new(),
        }
    }

    pub fn filter(mut self, filter: Record) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.batch_size = size;
        self
    }

    pub fn start(mut self, offset: u64) -> Self {
        self.start = offset;
        self
    }

    pub fn override_connection(mut self, connection: Arc<dyn DocumentStore>) -> Self {
        self.override_connection = Some(connection);
        self
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name, value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ns.store.is_empty() || self.ns.collection.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "store and collection names are required, got '{}'",
                self.ns
            )));
        }
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig(format!(
                "batch_size must be > 0 for {}",
                self.ns
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for TaskBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBinding")
            .field("ns", &self.ns)
            .field("filter", &self.filter)
            .field("limit", &self.limit)
            .field("batch_size", &self.batch_size)
            .field("start", &self.start)
            .field("override_connection", &self.override_connection.is_some())
            .field("params", &self.params)
            .finish()
    }
}

/// A registered task
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn SyncHandler>,
    pub binding: TaskBinding,
}

impl Registration {
    /// `handler@store.collection`
    pub fn label(&self) -> String {
        format!("{}@{}", self.handler.name(), self.binding.ns)
    }
}

/// Tasks keyed by handler identity, in registration order
#[derive(Clone, Default)]
pub struct TaskRegistry {
    entries: Vec<Registration>,
}

fn same_handler(a: &Arc<dyn SyncHandler>, b: &Arc<dyn SyncHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `binding`. Registering the same handler again
    /// replaces its binding; returns whether that happened.
    pub fn register(
        &mut self,
        handler: Arc<dyn SyncHandler>,
        binding: TaskBinding,
    ) -> Result<bool> {
        binding.validate()?;

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| same_handler(&entry.handler, &handler))
        {
            entry.binding = binding;
            return Ok(true);
        }

        self.entries.push(Registration { handler, binding });
        Ok(false)
    }

    pub fn binding(&self, handler: &Arc<dyn SyncHandler>) -> Option<&TaskBinding> {
        self.entries
            .iter()
            .find(|entry| same_handler(&entry.handler, handler))
            .map(|entry| &entry.binding)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
