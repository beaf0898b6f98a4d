//! Documents and collection addressing
//!
//! A [`Record`] is an unordered field map as returned by the store. The
//! store-assigned identity lives under [`IDENTITY_FIELD`] and is never part
//! of a write payload.

use crate::core::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Store-assigned identity field
pub const IDENTITY_FIELD: &str = "_id";

/// Timestamp stamped on inserts
pub const CREATION_FIELD: &str = "creation_date";

/// Timestamp refreshed on every insert or update
pub const MODIFIED_FIELD: &str = "modified_date";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Builder-style insert
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn identity(&self) -> Option<&Value> {
        self.0.get(IDENTITY_FIELD)
    }

    /// Remove the identity field in place, returning it if present
    pub fn strip_identity(&mut self) -> Option<Value> {
        self.0.remove(IDENTITY_FIELD)
    }

    pub fn without_identity(mut self) -> Self {
        self.strip_identity();
        self
    }

    /// Equality match on every field of `filter`. An empty filter matches all.
    pub fn matches(&self, filter: &Record) -> bool {
        filter
            .iter()
            .all(|(field, expected)| self.0.get(field) == Some(expected))
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SyncError::ExecutionError(format!(
                "expected a JSON object for a record, got {}",
                other
            ))),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// A collection inside a named store (database)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub store: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(store: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.store, self.collection)
    }
}
