use async_trait::async_trait;
use crate::core::{Namespace, Record, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A live session against a document store.
///
/// This trait is the whole surface the sync engine needs from a driver. Wrap a
/// real driver client to implement it for production use, or use
/// [`MemoryStore`](crate::storage::MemoryStore) in tests.
///
/// Read failures should be reported as `StoreUnavailable`, write failures as
/// `WriteError`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Number of documents in `ns` matching `filter`.
    async fn count(&self, ns: &Namespace, filter: &Record) -> Result<u64>;

    /// The `[start, end)` slice of the documents matching `filter`.
    ///
    /// Ordering is up to the store but must be stable for the duration of a run.
    async fn find_window(
        &self,
        ns: &Namespace,
        filter: &Record,
        start: u64,
        end: u64,
    ) -> Result<Vec<Record>>;

    /// First document matching `filter`, if any.
    async fn find_one(&self, ns: &Namespace, filter: &Record) -> Result<Option<Record>> {
        let mut window = self.find_window(ns, filter, 0, 1).await?;
        Ok(window.pop())
    }

    async fn insert(&self, ns: &Namespace, record: Record) -> Result<()>;

    /// Update the first document matching `filter`: set every field in
    /// `set_fields`, then remove every field named in `unset_fields`.
    async fn update(
        &self,
        ns: &Namespace,
        filter: &Record,
        set_fields: Record,
        unset_fields: &[String],
    ) -> Result<()>;

    async fn list_index_names(&self, ns: &Namespace) -> Result<BTreeSet<String>>;

    /// Create an index on `field_name`, named after the field.
    async fn create_index(&self, ns: &Namespace, field_name: &str) -> Result<()>;

    /// Close the underlying session
    async fn close(&self) -> Result<()>;
}

/// A factory for store sessions.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open a new session against `endpoint`. Fails with `ConnectionError`.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn DocumentStore>>;
}
