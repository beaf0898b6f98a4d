//! Insert-or-update with change detection
//!
//! [`UpsertEngine::save`] is best effort: store failures are logged and
//! reported in the returned [`SaveReport`], never raised. Callers must not
//! assume a write happened unless the report says so.

use super::change::{ChangeDetector, FieldChangeDetector};
use super::settings::DryRun;
use crate::core::{CREATION_FIELD, MODIFIED_FIELD, Namespace, Record, Result};
use crate::interface::DocumentStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What `save` should write and how to decide whether to write it
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub ns: Namespace,
    pub candidate: Record,
    /// Fields removed from the existing record on update
    pub unset_fields: Vec<String>,
    /// Fields that must carry an index
    pub index_names: Vec<String>,
    /// Locates the existing record. Empty means "always insert".
    pub filter: Record,
    /// Fields compared first on update
    pub check_columns: Vec<String>,
    /// Fields never compared on update
    pub exclude_columns: Vec<String>,
}

impl SaveRequest {
    pub fn new(ns: Namespace, candidate: Record) -> Self {
        Self {
            ns,
            candidate,
            unset_fields: Vec::new(),
            index_names: Vec::new(),
            filter: Record::new(),
            check_columns: Vec::new(),
            exclude_columns: vec![MODIFIED_FIELD.to_string()],
        }
    }

    pub fn filter(mut self, filter: Record) -> Self {
        self.filter = filter;
        self
    }

    pub fn unset<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.unset_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn indexes<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.index_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn check_columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.check_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_columns<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.exclude_columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// The write `save` issued, or would have issued
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WritePayload {
    Insert(Record),
    Update { set: Record, unset: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveAction {
    Inserted,
    Updated,
    /// Update path, nothing differed
    Unchanged,
    /// A write was due but dry-run suppressed it
    DryRun,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveReport {
    pub action: SaveAction,
    pub payload: Option<WritePayload>,
    pub indexes_created: Vec<String>,
    /// Missing indexes left alone because of dry-run
    pub indexes_skipped: Vec<String>,
}

impl SaveReport {
    fn new() -> Self {
        Self {
            action: SaveAction::Unchanged,
            payload: None,
            indexes_created: Vec::new(),
            indexes_skipped: Vec::new(),
        }
    }

    /// Whether the store was actually modified
    pub fn wrote(&self) -> bool {
        matches!(self.action, SaveAction::Inserted | SaveAction::Updated)
            || !self.indexes_created.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.action, SaveAction::Failed(_))
    }
}

/// Insert-or-update engine
#[derive(Clone)]
pub struct UpsertEngine {
    dry_run: DryRun,
    detector: Arc<dyn ChangeDetector>,
    clock: fn() -> DateTime<Utc>,
}

impl UpsertEngine {
    pub fn new(dry_run: DryRun) -> Self {
        Self {
            dry_run,
            detector: Arc::new(FieldChangeDetector),
            clock: Utc::now,
        }
    }

    /// Replace the change detector
    pub fn with_detector(mut self, detector: Arc<dyn ChangeDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Replace the timestamp source
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn dry_run(&self) -> DryRun {
        self.dry_run
    }

    /// Insert `request.candidate`, or update the record matched by
    /// `request.filter` when it differs, then make sure the requested indexes
    /// exist.
    pub async fn save(&self, store: &dyn DocumentStore, request: SaveRequest) -> SaveReport {
        let mut report = SaveReport::new();

        if let Err(err) = self.write(store, &request, &mut report).await {
            error!(
                "save to {} failed: {}; filter={} payload={:?}",
                request.ns, err, request.filter, report.payload
            );
            report.action = SaveAction::Failed(err.to_string());
            return report;
        }

        if let Err(err) = self.ensure_indexes(store, &request, &mut report).await {
            error!(
                "index maintenance on {} failed: {}; requested={:?}",
                request.ns, err, request.index_names
            );
            report.action = SaveAction::Failed(err.to_string());
        }

        report
    }

    async fn write(
        &self,
        store: &dyn DocumentStore,
        request: &SaveRequest,
        report: &mut SaveReport,
    ) -> Result<()> {
        let candidate = request.candidate.clone().without_identity();

        let existing = if request.filter.is_empty() {
            None
        } else {
            store.find_one(&request.ns, &request.filter).await?
        };

        let now = self.timestamp();

        match existing {
            Some(existing) => {
                let mut set = candidate;
                set.insert(MODIFIED_FIELD, now);
                report.payload = Some(WritePayload::Update {
                    set: set.clone(),
                    unset: request.unset_fields.clone(),
                });

                if !self.detect_change(&existing, &set, request) {
                    debug!("{} unchanged for filter {}", request.ns, request.filter);
                    report.action = SaveAction::Unchanged;
                    return Ok(());
                }

                debug!(
                    "update {} filter={} set={} unset={:?}",
                    request.ns, request.filter, set, request.unset_fields
                );
                if self.dry_run.enabled {
                    report.action = SaveAction::DryRun;
                    return Ok(());
                }

                store
                    .update(&request.ns, &request.filter, set, &request.unset_fields)
                    .await?;
                report.action = SaveAction::Updated;
            }
            None => {
                let mut record = candidate;
                record.insert(CREATION_FIELD, now.clone());
                record.insert(MODIFIED_FIELD, now);
                report.payload = Some(WritePayload::Insert(record.clone()));

                debug!("insert {} {}", request.ns, record);
                if self.dry_run.enabled {
                    report.action = SaveAction::DryRun;
                    return Ok(());
                }

                store.insert(&request.ns, record).await?;
                report.action = SaveAction::Inserted;
            }
        }

        Ok(())
    }

    /// The refreshed modification stamp is never compared.
    fn detect_change(&self, existing: &Record, set: &Record, request: &SaveRequest) -> bool {
        let mut exclude = request.exclude_columns.clone();
        if !exclude.iter().any(|c| c == MODIFIED_FIELD) {
            exclude.push(MODIFIED_FIELD.to_string());
        }

        match self
            .detector
            .has_changed(existing, set, &request.check_columns, &exclude)
        {
            Ok(changed) => changed,
            Err(err) => {
                warn!(
                    "change detection on {} failed, assuming changed: {}; \
                     columns={:?} exclude={:?} new={} old={}",
                    request.ns, err, request.check_columns, exclude, set, existing
                );
                true
            }
        }
    }

    async fn ensure_indexes(
        &self,
        store: &dyn DocumentStore,
        request: &SaveRequest,
        report: &mut SaveReport,
    ) -> Result<()> {
        if request.index_names.is_empty() {
            return Ok(());
        }

        let existing = store.list_index_names(&request.ns).await?;
        for name in &request.index_names {
            if existing.contains(name)
                || report.indexes_created.contains(name)
                || report.indexes_skipped.contains(name)
            {
                continue;
            }

            if self.dry_run.enabled {
                report.indexes_skipped.push(name.clone());
                continue;
            }

            store.create_index(&request.ns, name).await?;
            info!("created index '{}' on {}", name, request.ns);
            report.indexes_created.push(name.clone());
        }

        Ok(())
    }

    fn timestamp(&self) -> Value {
        Value::String((self.clock)().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Default for UpsertEngine {
    fn default() -> Self {
        Self::new(DryRun::disabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IDENTITY_FIELD, SyncError};
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn rec(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    fn ns() -> Namespace {
        Namespace::new("db", "col")
    }

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    const FIXED: &str = "2024-05-01T12:00:00.000Z";

    #[tokio::test]
    async fn test_empty_filter_always_inserts() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"code": "a"}))]);
        let conn = store.connect();
        let engine = UpsertEngine::default().with_clock(fixed_clock);

        let report = engine
            .save(conn.as_ref(), SaveRequest::new(ns(), rec(json!({"code": "a"}))))
            .await;

        assert_eq!(report.action, SaveAction::Inserted);
        assert_eq!(store.documents(&ns()).len(), 2);

        let inserted = &store.documents(&ns())[1];
        assert_eq!(inserted.get(CREATION_FIELD), Some(&json!(FIXED)));
        assert_eq!(inserted.get(MODIFIED_FIELD), Some(&json!(FIXED)));
    }

    #[tokio::test]
    async fn test_insert_when_filter_misses() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let engine = UpsertEngine::default();

        let request = SaveRequest::new(ns(), rec(json!({"code": "z", "_id": "client-side"})))
            .filter(rec(json!({"code": "z"})));
        let report = engine.save(conn.as_ref(), request).await;

        assert_eq!(report.action, SaveAction::Inserted);
        match report.payload {
            Some(WritePayload::Insert(ref payload)) => {
                assert!(!payload.contains_key(IDENTITY_FIELD));
                assert!(payload.contains_key(CREATION_FIELD));
            }
            ref other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_only_when_changed() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"a": 1, "b": 2}))]);
        let conn = store.connect();
        let engine = UpsertEngine::default();
        let filter = rec(json!({"a": 1}));

        let same = SaveRequest::new(ns(), rec(json!({"a": 1, "b": 2})))
            .filter(filter.clone())
            .exclude_columns(Vec::<String>::new());
        let report = engine.save(conn.as_ref(), same).await;
        assert_eq!(report.action, SaveAction::Unchanged);
        assert_eq!(store.stats().updates, 0);
        assert!(matches!(report.payload, Some(WritePayload::Update { .. })));

        let changed = SaveRequest::new(ns(), rec(json!({"a": 1, "b": 3})))
            .filter(filter)
            .exclude_columns(Vec::<String>::new());
        let report = engine.save(conn.as_ref(), changed).await;
        assert_eq!(report.action, SaveAction::Updated);
        assert_eq!(store.stats().updates, 1);
        assert_eq!(store.documents(&ns())[0].get("b"), Some(&json!(3)));
        assert!(store.documents(&ns())[0].contains_key(MODIFIED_FIELD));
    }

    #[tokio::test]
    async fn test_update_applies_unset() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"code": "a", "legacy": true, "v": 1}))]);
        let conn = store.connect();

        let request = SaveRequest::new(ns(), rec(json!({"code": "a", "v": 2})))
            .filter(rec(json!({"code": "a"})))
            .unset(["legacy"]);
        let report = UpsertEngine::default().save(conn.as_ref(), request).await;

        assert_eq!(report.action, SaveAction::Updated);
        assert!(!store.documents(&ns())[0].contains_key("legacy"));
    }

    #[tokio::test]
    async fn test_identity_never_in_update_payload() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"_id": "keep", "code": "a", "v": 1}))]);
        let conn = store.connect();

        let request = SaveRequest::new(ns(), rec(json!({"_id": "other", "code": "a", "v": 2})))
            .filter(rec(json!({"code": "a"})));
        let report = UpsertEngine::default().save(conn.as_ref(), request).await;

        match report.payload {
            Some(WritePayload::Update { ref set, .. }) => {
                assert!(!set.contains_key(IDENTITY_FIELD))
            }
            ref other => panic!("unexpected payload {:?}", other),
        }
        assert_eq!(store.documents(&ns())[0].identity(), Some(&json!("keep")));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"a": 1, "b": 2}))]);
        let conn = store.connect();
        let engine = UpsertEngine::new(DryRun::enabled(Duration::ZERO));

        let insert = SaveRequest::new(ns(), rec(json!({"a": 9}))).indexes(["a"]);
        let report = engine.save(conn.as_ref(), insert).await;
        assert_eq!(report.action, SaveAction::DryRun);
        assert!(matches!(report.payload, Some(WritePayload::Insert(_))));
        assert_eq!(report.indexes_skipped, vec!["a".to_string()]);

        let update =
            SaveRequest::new(ns(), rec(json!({"a": 1, "b": 3}))).filter(rec(json!({"a": 1})));
        let report = engine.save(conn.as_ref(), update).await;
        assert_eq!(report.action, SaveAction::DryRun);

        assert_eq!(store.stats().writes(), 0);
        assert!(!report.wrote());
    }

    #[tokio::test]
    async fn test_creates_missing_indexes_once() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let engine = UpsertEngine::default();

        let request =
            SaveRequest::new(ns(), rec(json!({"code": "a"}))).indexes(["code", "code", "_id_"]);
        let report = engine.save(conn.as_ref(), request.clone()).await;
        assert_eq!(report.indexes_created, vec!["code".to_string()]);

        let report = engine.save(conn.as_ref(), request).await;
        assert!(report.indexes_created.is_empty());
        assert_eq!(store.stats().indexes_created, 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_not_raised() {
        let store = MemoryStore::new();
        store.faults().fail_writes(true);
        let conn = store.connect();

        let report = UpsertEngine::default()
            .save(conn.as_ref(), SaveRequest::new(ns(), rec(json!({"a": 1}))).indexes(["a"]))
            .await;

        assert!(report.is_failed());
        assert!(report.payload.is_some());
        assert!(store.indexes(&ns()).is_empty());
    }

    struct BrokenDetector;

    impl ChangeDetector for BrokenDetector {
        fn has_changed(&self, _: &Record, _: &Record, _: &[String], _: &[String]) -> Result<bool> {
            Err(SyncError::ExecutionError("comparison blew up".into()))
        }
    }

    #[tokio::test]
    async fn test_detector_fault_fails_safe() {
        let store = MemoryStore::new();
        store.seed(&ns(), [rec(json!({"a": 1}))]);
        let conn = store.connect();
        let engine = UpsertEngine::default().with_detector(Arc::new(BrokenDetector));

        let request = SaveRequest::new(ns(), rec(json!({"a": 1}))).filter(rec(json!({"a": 1})));
        let report = engine.save(conn.as_ref(), request).await;

        assert_eq!(report.action, SaveAction::Updated);
    }
}
