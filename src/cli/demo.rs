//! Sample tasks for the `demo` command

use anyhow::Result;
use docsync::storage::MemoryStore;
use docsync::sync::{SaveAction, SaveReport};
use docsync::{Namespace, Record, SaveRequest, SyncEngine, handler_fn};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const TIERS: [&str; 3] = ["budget", "standard", "premium"];

pub fn products() -> Namespace {
    Namespace::new("demo", "products")
}

pub fn catalog() -> Namespace {
    Namespace::new("demo", "catalog")
}

pub fn audit() -> Namespace {
    Namespace::new("demo", "audit")
}

fn product(i: u64) -> Record {
    Record::new()
        .with("sku", format!("SKU-{:05}", i))
        .with("name", format!("Product {}", i))
        .with("price", json!((i % 50) * 100 + 99))
        .with("tier", TIERS[(i % 3) as usize])
}

/// Fill the source collection, and pre-populate a quarter of the catalog so
/// the run hits the update and unchanged paths too.
pub fn seed(store: &MemoryStore, documents: u64) {
    store.seed(&products(), (0..documents).map(product));

    store.seed(
        &catalog(),
        (0..documents / 4).map(|i| {
            let stale = if i % 2 == 0 { product(i) } else { product(i).with("price", 1) };
            stale.with("synced_from", "products")
        }),
    );
}

/// Counts of save outcomes across all tasks
#[derive(Default)]
pub struct Tally {
    inserted: AtomicU64,
    updated: AtomicU64,
    unchanged: AtomicU64,
    dry_run: AtomicU64,
    failed: AtomicU64,
}

impl Tally {
    fn record(&self, report: &SaveReport) {
        let counter = match report.action {
            SaveAction::Inserted => &self.inserted,
            SaveAction::Updated => &self.updated,
            SaveAction::Unchanged => &self.unchanged,
            SaveAction::DryRun => &self.dry_run,
            SaveAction::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "saves: {} inserted, {} updated, {} unchanged, {} dry-run, {} failed",
            self.inserted.load(Ordering::Relaxed),
            self.updated.load(Ordering::Relaxed),
            self.unchanged.load(Ordering::Relaxed),
            self.dry_run.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        )
    }
}

pub fn register(engine: &mut SyncEngine, limit: u64) -> Result<Arc<Tally>> {
    let tally = Arc::new(Tally::default());

    let copy_tally = Arc::clone(&tally);
    let copy = handler_fn("catalog-copy", move |record, ctx| {
        let tally = Arc::clone(&copy_tally);
        async move {
            let sku = record
                .get("sku")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("product without sku: {}", record))?;
            let candidate = record.without_identity().with("synced_from", "products");

            let request = SaveRequest::new(catalog(), candidate)
                .filter(Record::new().with("sku", sku))
                .indexes(["sku"]);
            tally.record(&ctx.save(request).await);
            Ok(())
        }
    });
    let binding = engine.binding(&products().store, &products().collection).limit(limit);
    engine.register(copy, binding)?;

    let audit_tally = Arc::clone(&tally);
    let flag_budget = handler_fn("budget-audit", move |record, ctx| {
        let tally = Arc::clone(&audit_tally);
        async move {
            let flag = ctx.param("flag").cloned().unwrap_or(json!("review"));
            let candidate = Record::new()
                .with("sku", record.get("sku").cloned().unwrap_or_default())
                .with("price", record.get("price").cloned().unwrap_or_default())
                .with("flag", flag);
            let sku = candidate.get("sku").cloned().unwrap_or_default();
            let filter = Record::new().with("sku", sku);

            tally.record(&ctx.save(SaveRequest::new(audit(), candidate).filter(filter)).await);
            Ok(())
        }
    });
    let binding = engine
        .binding(&products().store, &products().collection)
        .filter(Record::new().with("tier", "budget"))
        .limit(limit)
        .param("flag", "clearance");
    engine.register(flag_budget, binding)?;

    Ok(tally)
}
