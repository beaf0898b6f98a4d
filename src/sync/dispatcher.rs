//! Concurrent execution of every registered task
//!
//! Each task gets its own job. At most `worker_count` jobs hold a worker slot
//! at a time; the rest queue for one. A job binds one connection for the whole
//! run: either the binding's override connection or a fresh lease from the
//! pool, which is destroyed when the run ends however it ends.

use super::driver::{BatchDriver, BatchOutcome, TaskStatus};
use super::settings::DryRun;
use super::task::{Registration, TaskRegistry};
use crate::connection::ConnectionPool;
use crate::core::{Namespace, Result, SyncError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSource {
    Pooled,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub namespace: Namespace,
    pub connection: ConnectionSource,
    pub total: Option<u64>,
    pub processed: u64,
    pub status: TaskStatus,
    pub elapsed_ms: u64,
}

impl TaskReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed(_))
    }
}

/// Reports for every task, in registration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub tasks: Vec<TaskReport>,
}

impl DispatchReport {
    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_failed()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.tasks.len() - self.failed()
    }

    pub fn processed(&self) -> u64 {
        self.tasks.iter().map(|t| t.processed).sum()
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tasks: {} succeeded, {} failed, {} records processed",
            self.tasks.len(),
            self.succeeded(),
            self.failed(),
            self.processed()
        )?;
        for task in &self.tasks {
            let total = task.total.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
            writeln!(
                f,
                "  {:<40} {:>8}/{:<8} {:?} ({} ms)",
                task.task, task.processed, total, task.status, task.elapsed_ms
            )?;
        }
        Ok(())
    }
}

pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    dry_run: DryRun,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, dry_run: DryRun) -> Self {
        Self { pool, dry_run }
    }

    /// Run every task in `registry` and wait for all of them.
    ///
    /// Task failures end up in the report; only an invalid `worker_count` is
    /// an error.
    pub async fn run(
        &self,
        registry: &TaskRegistry,
        worker_count: usize,
    ) -> Result<DispatchReport> {
        if worker_count == 0 {
            return Err(SyncError::InvalidConfig("worker_count must be > 0".to_string()));
        }

        info!(
            "dispatching {} tasks on {} workers{}",
            registry.len(),
            worker_count,
            if self.dry_run.enabled { " (dry run)" } else { "" }
        );

        let workers = Arc::new(Semaphore::new(worker_count));
        let mut jobs = Vec::with_capacity(registry.len());

        for registration in registry.iter().cloned() {
            let label = registration.label();
            let namespace = registration.binding.ns.clone();
            let workers = Arc::clone(&workers);
            let pool = Arc::clone(&self.pool);
            let dry_run = self.dry_run;
            let span = info_span!("sync_task", task = %label);

            let handle = tokio::spawn(
                async move {
                    let _slot = match workers.acquire_owned().await {
                        Ok(slot) => slot,
                        Err(err) => {
                            error!("worker pool closed: {}", err);
                            return failed_report(
                                &registration,
                                ConnectionSource::Pooled,
                                err.to_string(),
                                Instant::now(),
                            );
                        }
                    };
                    run_task(pool, registration, dry_run).await
                }
                .instrument(span),
            );
            jobs.push((label, namespace, handle));
        }

        let mut report = DispatchReport::default();
        for (label, namespace, handle) in jobs {
            match handle.await {
                Ok(task) => report.tasks.push(task),
                Err(err) => {
                    error!("{}: job did not finish: {}", label, err);
                    report.tasks.push(TaskReport {
                        task: label,
                        namespace,
                        connection: ConnectionSource::Pooled,
                        total: None,
                        processed: 0,
                        status: TaskStatus::Failed(err.to_string()),
                        elapsed_ms: 0,
                    });
                }
            }
        }

        info!(
            "dispatch finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }
}

async fn run_task(
    pool: Arc<ConnectionPool>,
    registration: Registration,
    dry_run: DryRun,
) -> TaskReport {
    let started = Instant::now();
    let label = registration.label();

    let (client, lease, source) = match &registration.binding.override_connection {
        Some(connection) => (Arc::clone(connection), None, ConnectionSource::Override),
        None => match pool.acquire_timeout(pool.config().acquire_timeout).await {
            Ok(lease) => (lease.client(), Some(lease), ConnectionSource::Pooled),
            Err(err) => {
                error!("{}: no connection: {}", label, err);
                let reason = err.to_string();
                return failed_report(&registration, ConnectionSource::Pooled, reason, started);
            }
        },
    };

    info!("{}: started", label);

    // The run gets its own task so a panicking handler still lets us destroy the lease.
    let driver = BatchDriver::new(dry_run);
    let job = {
        let registration = registration.clone();
        tokio::spawn(async move { driver.run(&registration, client).await })
    };
    let outcome = job.await.unwrap_or_else(|err| {
        error!("{}: run panicked: {}", label, err);
        BatchOutcome {
            total: None,
            processed: 0,
            status: TaskStatus::Failed(format!("handler panicked: {}", err)),
        }
    });

    if let Some(lease) = lease {
        if !pool.destroy(lease.id()).await {
            warn!("{}: connection {} was already gone", label, lease.id());
        }
    }

    info!(
        "{}: {:?} after {} records in {:?}",
        label,
        outcome.status,
        outcome.processed,
        started.elapsed()
    );

    TaskReport {
        task: label,
        namespace: registration.binding.ns.clone(),
        connection: source,
        total: outcome.total,
        processed: outcome.processed,
        status: outcome.status,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn failed_report(
    registration: &Registration,
    connection: ConnectionSource,
    reason: String,
    started: Instant,
) -> TaskReport {
    TaskReport {
        task: registration.label(),
        namespace: registration.binding.ns.clone(),
        connection,
        total: None,
        processed: 0,
        status: TaskStatus::Failed(reason),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::core::Record;
    use crate::interface::DocumentStore;
    use crate::storage::MemoryStore;
    use crate::sync::task::{TaskBinding, handler_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn seeded(collections: &[&str], docs: u64) -> MemoryStore {
        let store = MemoryStore::new();
        for collection in collections {
            store.seed(
                &Namespace::new("db", *collection),
                (0..docs).map(|i| Record::new().with("n", i)),
            );
        }
        store
    }

    fn pool(store: &MemoryStore, max: usize) -> Arc<ConnectionPool> {
        let config = ConnectionConfig::default()
            .max_connections(max)
            .acquire_timeout(Duration::from_secs(5));
        Arc::new(ConnectionPool::new(config, store.connector()).unwrap())
    }

    #[tokio::test]
    async fn test_runs_all_tasks_and_destroys_connections() {
        let store = seeded(&["a", "b", "c", "d"], 5);
        let pool = pool(&store, 10);
        let mut registry = TaskRegistry::new();
        for collection in ["a", "b", "c", "d"] {
            registry
                .register(
                    handler_fn(collection, |_r, _c| async { Ok(()) }),
                    TaskBinding::new("db", collection).batch_size(2),
                )
                .unwrap();
        }

        let report = Dispatcher::new(Arc::clone(&pool), DryRun::disabled())
            .run(&registry, 2)
            .await
            .unwrap();

        assert_eq!(report.tasks.len(), 4);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.processed(), 20);
        assert_eq!(report.tasks[0].namespace, Namespace::new("db", "a"));
        assert_eq!(pool.stats().await.total_connections, 0);
        assert_eq!(store.stats().connections_opened, store.stats().connections_closed);
    }

    #[tokio::test]
    async fn test_worker_count_bounds_parallelism() {
        let store = seeded(&["a", "b", "c", "d", "e", "f"], 2);
        let pool = pool(&store, 10);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut registry = TaskRegistry::new();
        for collection in ["a", "b", "c", "d", "e", "f"] {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            let handler = handler_fn(collection, move |_r, _c| {
                let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            registry
                .register(handler, TaskBinding::new("db", collection))
                .unwrap();
        }

        let report = Dispatcher::new(pool, DryRun::disabled())
            .run(&registry, 2)
            .await
            .unwrap();

        assert_eq!(report.failed(), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_affect_siblings() {
        let store = seeded(&["good", "bad"], 3);
        let pool = pool(&store, 4);
        let mut registry = TaskRegistry::new();
        registry
            .register(
                handler_fn("bad", |_r, _c| async { Err(anyhow::anyhow!("boom")) }),
                TaskBinding::new("db", "bad"),
            )
            .unwrap();
        registry
            .register(
                handler_fn("good", |_r, _c| async { Ok(()) }),
                TaskBinding::new("db", "good"),
            )
            .unwrap();

        let report = Dispatcher::new(Arc::clone(&pool), DryRun::disabled())
            .run(&registry, 2)
            .await
            .unwrap();

        assert_eq!(report.failed(), 1);
        assert!(report.tasks[0].is_failed());
        assert_eq!(report.tasks[1].status, TaskStatus::Completed);
        assert_eq!(report.tasks[1].processed, 3);
        assert_eq!(pool.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_still_destroys_connection() {
        let store = seeded(&["a"], 1);
        let pool = pool(&store, 1);
        let mut registry = TaskRegistry::new();
        registry
            .register(
                handler_fn("panics", |record, _c| async move {
                    if record.contains_key("n") {
                        panic!("handler bug");
                    }
                    Ok(())
                }),
                TaskBinding::new("db", "a"),
            )
            .unwrap();

        let report = Dispatcher::new(Arc::clone(&pool), DryRun::disabled())
            .run(&registry, 1)
            .await
            .unwrap();

        assert!(report.tasks[0].is_failed());
        assert_eq!(pool.stats().await.total_connections, 0);
        assert_eq!(store.stats().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_override_connection_bypasses_pool() {
        let store = seeded(&["a"], 3);
        let pool = pool(&store, 1);
        let own = store.connect();

        let mut registry = TaskRegistry::new();
        registry
            .register(
                handler_fn("h", |_r, _c| async { Ok(()) }),
                TaskBinding::new("db", "a").override_connection(Arc::clone(&own)),
            )
            .unwrap();

        let report = Dispatcher::new(Arc::clone(&pool), DryRun::disabled())
            .run(&registry, 1)
            .await
            .unwrap();

        assert_eq!(report.tasks[0].connection, ConnectionSource::Override);
        assert_eq!(report.tasks[0].processed, 3);
        assert_eq!(store.stats().connections_opened, 1);
        assert_eq!(store.stats().connections_closed, 0);
        assert!(own.count(&Namespace::new("db", "a"), &Record::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_more_tasks_than_pool_capacity_queue() {
        let store = seeded(&["a", "b", "c"], 2);
        let pool = pool(&store, 1);
        let mut registry = TaskRegistry::new();
        for collection in ["a", "b", "c"] {
            registry
                .register(
                    handler_fn(collection, |_r, _c| async { Ok(()) }),
                    TaskBinding::new("db", collection),
                )
                .unwrap();
        }

        let report = Dispatcher::new(pool, DryRun::disabled())
            .run(&registry, 3)
            .await
            .unwrap();

        assert_eq!(report.failed(), 0);
        assert_eq!(store.stats().connections_opened, 3);
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let store = MemoryStore::new();
        let registry = TaskRegistry::new();
        let result = Dispatcher::new(pool(&store, 1), DryRun::disabled())
            .run(&registry, 0)
            .await;
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
