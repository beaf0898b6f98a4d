//! In-process document store
//!
//! Implements [`DocumentStore`] and [`StoreConnector`] over shared in-memory
//! collections. Every session opened by the connector sees the same data. The
//! store counts operations, remembers which windows were fetched, and can be
//! told to fail specific operations.

use crate::core::{IDENTITY_FIELD, Namespace, Record, Result, SyncError};
use crate::interface::{DocumentStore, StoreConnector};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Name of the index every collection carries
pub const DEFAULT_INDEX: &str = "_id_";

#[derive(Default)]
struct Collection {
    documents: Vec<Record>,
    indexes: BTreeSet<String>,
}

#[derive(Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    counts: AtomicU64,
    finds: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    indexes_created: AtomicU64,
}

/// Operations the store should refuse
#[derive(Default)]
pub struct Faults {
    connect: AtomicBool,
    count: AtomicBool,
    find: AtomicBool,
    write: AtomicBool,
}

impl Faults {
    pub fn fail_connect(&self, fail: bool) {
        self.connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_count(&self, fail: bool) {
        self.count.store(fail, Ordering::SeqCst);
    }

    pub fn fail_find(&self, fail: bool) {
        self.find.store(fail, Ordering::SeqCst);
    }

    /// Inserts, updates and index creation
    pub fn fail_writes(&self, fail: bool) {
        self.write.store(fail, Ordering::SeqCst);
    }

    fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Shared {
    collections: RwLock<HashMap<Namespace, Collection>>,
    windows: Mutex<Vec<(Namespace, u64, u64)>>,
    counters: Counters,
    faults: Faults,
    next_session: AtomicU64,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Namespace, Collection>> {
        self.collections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Namespace, Collection>> {
        self.collections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn windows(&self) -> MutexGuard<'_, Vec<(Namespace, u64, u64)>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of the store's operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStoreStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub counts: u64,
    pub finds: u64,
    pub inserts: u64,
    pub updates: u64,
    pub indexes_created: u64,
}

impl MemoryStoreStats {
    /// Inserts, updates and index creations combined
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.indexes_created
    }
}

/// Shared in-memory document store
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose sessions all point at this store
    pub fn connector(&self) -> Arc<dyn StoreConnector> {
        Arc::new(MemoryConnector {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Open a session directly, outside of any pool
    pub fn connect(&self) -> Arc<dyn DocumentStore> {
        Arc::new(open_session(&self.shared))
    }

    /// Append documents to `ns` as-is, without stamping or counting them as writes
    pub fn seed(&self, ns: &Namespace, documents: impl IntoIterator<Item = Record>) {
        let mut collections = self.shared.write();
        let collection = collections.entry(ns.clone()).or_default();
        for mut document in documents {
            if !document.contains_key(IDENTITY_FIELD) {
                document.insert(IDENTITY_FIELD, new_identity());
            }
            collection.documents.push(document);
        }
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<Record> {
        self.shared
            .read()
            .get(ns)
            .map(|collection| collection.documents.clone())
            .unwrap_or_default()
    }

    pub fn indexes(&self, ns: &Namespace) -> BTreeSet<String> {
        self.shared
            .read()
            .get(ns)
            .map(|collection| collection.indexes.clone())
            .unwrap_or_default()
    }

    /// `[start, end)` windows fetched from `ns`, in fetch order
    pub fn fetched_windows(&self, ns: &Namespace) -> Vec<(u64, u64)> {
        self.shared
            .windows()
            .iter()
            .filter(|(fetched, _, _)| fetched == ns)
            .map(|(_, start, end)| (*start, *end))
            .collect()
    }

    pub fn faults(&self) -> &Faults {
        &self.shared.faults
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let c = &self.shared.counters;
        MemoryStoreStats {
            connections_opened: c.connections_opened.load(Ordering::SeqCst),
            connections_closed: c.connections_closed.load(Ordering::SeqCst),
            counts: c.counts.load(Ordering::SeqCst),
            finds: c.finds.load(Ordering::SeqCst),
            inserts: c.inserts.load(Ordering::SeqCst),
            updates: c.updates.load(Ordering::SeqCst),
            indexes_created: c.indexes_created.load(Ordering::SeqCst),
        }
    }
}

fn new_identity() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

fn open_session(shared: &Arc<Shared>) -> MemoryConnection {
    shared.counters.connections_opened.fetch_add(1, Ordering::SeqCst);
    MemoryConnection {
        session: shared.next_session.fetch_add(1, Ordering::SeqCst),
        shared: Arc::clone(shared),
        closed: AtomicBool::new(false),
    }
}

pub struct MemoryConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn DocumentStore>> {
        if Faults::is_set(&self.shared.faults.connect) {
            return Err(SyncError::ConnectionError(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        Ok(Arc::new(open_session(&self.shared)))
    }
}

/// One session against a [`MemoryStore`]
pub struct MemoryConnection {
    session: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable(format!(
                "session {} is closed",
                self.session
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self, ns: &Namespace) -> Result<()> {
        self.ensure_open()?;
        if Faults::is_set(&self.shared.faults.write) {
            return Err(SyncError::WriteError(format!("{} rejected the write", ns)));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryConnection {
    async fn count(&self, ns: &Namespace, filter: &Record) -> Result<u64> {
        self.ensure_open()?;
        if Faults::is_set(&self.shared.faults.count) {
            return Err(SyncError::StoreUnavailable(format!("count on {} failed", ns)));
        }
        self.shared.counters.counts.fetch_add(1, Ordering::SeqCst);

        let collections = self.shared.read();
        let total = collections
            .get(ns)
            .map(|c| c.documents.iter().filter(|d| d.matches(filter)).count())
            .unwrap_or(0);
        Ok(total as u64)
    }

    async fn find_window(
        &self,
        ns: &Namespace,
        filter: &Record,
        start: u64,
        end: u64,
    ) -> Result<Vec<Record>> {
        self.ensure_open()?;
        if Faults::is_set(&self.shared.faults.find) {
            return Err(SyncError::StoreUnavailable(format!("find on {} failed", ns)));
        }
        self.shared.counters.finds.fetch_add(1, Ordering::SeqCst);
        self.shared.windows().push((ns.clone(), start, end));

        let collections = self.shared.read();
        let window = collections
            .get(ns)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| d.matches(filter))
                    .skip(start as usize)
                    .take(end.saturating_sub(start) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(window)
    }

    async fn insert(&self, ns: &Namespace, mut record: Record) -> Result<()> {
        self.ensure_writable(ns)?;
        if !record.contains_key(IDENTITY_FIELD) {
            record.insert(IDENTITY_FIELD, new_identity());
        }

        let mut collections = self.shared.write();
        collections.entry(ns.clone()).or_default().documents.push(record);
        self.shared.counters.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(
        &self,
        ns: &Namespace,
        filter: &Record,
        set_fields: Record,
        unset_fields: &[String],
    ) -> Result<()> {
        self.ensure_writable(ns)?;

        let mut collections = self.shared.write();
        let target = collections
            .get_mut(ns)
            .and_then(|c| c.documents.iter_mut().find(|d| d.matches(filter)));

        if let Some(document) = target {
            for (field, value) in set_fields.iter() {
                if field != IDENTITY_FIELD {
                    document.insert(field.clone(), value.clone());
                }
            }
            for field in unset_fields {
                document.remove(field);
            }
        }
        self.shared.counters.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_index_names(&self, ns: &Namespace) -> Result<BTreeSet<String>> {
        self.ensure_open()?;
        let mut names = self.shared.read().get(ns).map(|c| c.indexes.clone()).unwrap_or_default();
        names.insert(DEFAULT_INDEX.to_string());
        Ok(names)
    }

    async fn create_index(&self, ns: &Namespace, field_name: &str) -> Result<()> {
        self.ensure_writable(ns)?;

        let mut collections = self.shared.write();
        collections
            .entry(ns.clone())
            .or_default()
            .indexes
            .insert(field_name.to_string());
        self.shared.counters.indexes_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.counters.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
