//! Windowed pagination over a task's matching documents
//!
//! The driver counts the documents matching the binding's filter, then fetches
//! `[start, start + batch_size)` windows clipped to the total and feeds every
//! record to the handler. A limit stops the run right after the record that
//! reaches it, even in the middle of a window.

use super::settings::DryRun;
use super::task::{Registration, SyncContext};
use crate::core::{Result, SyncError};
use crate::interface::DocumentStore;
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Half-open windows covering `[start, total)` in steps of `batch_size`,
/// the last one clipped to `total`.
pub fn windows(start: u64, total: u64, batch_size: u64) -> impl Iterator<Item = Range<u64>> {
    let step = batch_size.max(1);
    (start..total)
        .step_by(step as usize)
        .map(move |lo| lo..lo.saturating_add(step).min(total))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Every matching document was processed
    Completed,
    /// Stopped at the binding's limit
    LimitReached,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Matching documents, if counting succeeded
    pub total: Option<u64>,
    /// Records the handler finished successfully
    pub processed: u64,
    pub status: TaskStatus,
}

pub struct BatchDriver {
    dry_run: DryRun,
}

impl BatchDriver {
    pub fn new(dry_run: DryRun) -> Self {
        Self { dry_run }
    }

    /// Stream the binding's documents through its handler using `store`.
    ///
    /// Never fails: store and handler errors end the run and are reported in
    /// the outcome's status.
    pub async fn run(
        &self,
        registration: &Registration,
        store: Arc<dyn DocumentStore>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            total: None,
            processed: 0,
            status: TaskStatus::Completed,
        };

        match self.drive(registration, store, &mut outcome).await {
            Ok(status) => outcome.status = status,
            Err(err) => {
                error!(
                    "{}: run aborted after {} records: {}; filter={}",
                    registration.label(),
                    outcome.processed,
                    err,
                    registration.binding.filter
                );
                outcome.status = TaskStatus::Failed(err.to_string());
            }
        }

        outcome
    }

    async fn drive(
        &self,
        registration: &Registration,
        store: Arc<dyn DocumentStore>,
        outcome: &mut BatchOutcome,
    ) -> Result<TaskStatus> {
        let binding = &registration.binding;
        let label = registration.label();

        let total = store
            .count(&binding.ns, &binding.filter)
            .await
            .map_err(unavailable)?;
        outcome.total = Some(total);
        info!("{}: {} documents match {}", label, total, binding.filter);

        if binding.limit > 0 {
            debug!("{}: limited to {} records", label, binding.limit);
        }

        let ctx = SyncContext::new(
            binding.ns.clone(),
            Arc::clone(&store),
            self.dry_run,
            binding.params.clone(),
        );

        for window in windows(binding.start, total, binding.batch_size) {
            let records = store
                .find_window(&binding.ns, &binding.filter, window.start, window.end)
                .await
                .map_err(unavailable)?;

            for record in records {
                let payload = record.clone();
                registration
                    .handler
                    .process(record, &ctx)
                    .await
                    .map_err(|err| SyncError::Handler(format!("{:#}; record={}", err, payload)))?;

                outcome.processed += 1;
                debug!("{}: {}/{}", label, outcome.processed, total);

                if let Some(delay) = self.dry_run.pacing_delay() {
                    tokio::time::sleep(delay).await;
                }

                if binding.limit > 0 && outcome.processed == binding.limit {
                    info!("{}: limit of {} reached, stopping", label, binding.limit);
                    return Ok(TaskStatus::LimitReached);
                }
            }
        }

        Ok(TaskStatus::Completed)
    }
}

fn unavailable(err: SyncError) -> SyncError {
    match err {
        SyncError::StoreUnavailable(msg) => SyncError::StoreUnavailable(msg),
        other => SyncError::StoreUnavailable(other.to_string()),
    }
}
