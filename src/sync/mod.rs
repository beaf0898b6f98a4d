//! Batch synchronization
//!
//! - `change.rs` - field-level change detection
//! - `upsert.rs` - insert-or-update with dry-run and index maintenance
//! - `driver.rs` - windowed pagination feeding a handler
//! - `task.rs` - handlers, bindings and the task registry
//! - `dispatcher.rs` - concurrent execution over a worker pool
//! - `settings.rs` - dry-run and engine settings

pub mod change;
pub mod dispatcher;
pub mod driver;
pub mod settings;
pub mod task;
pub mod upsert;

pub use change::{ChangeDetector, FieldChangeDetector, has_changed};
pub use dispatcher::{ConnectionSource, DispatchReport, Dispatcher, TaskReport};
pub use driver::{BatchDriver, BatchOutcome, TaskStatus, windows};
pub use settings::{
    DEFAULT_BATCH_SIZE, DEFAULT_DRY_RUN_PACING, DEFAULT_WORKERS, DryRun, SyncConfig,
};
pub use task::{
    FnHandler, Registration, SyncContext, SyncHandler, TaskBinding, TaskRegistry, handler_fn,
};
pub use upsert::{SaveAction, SaveReport, SaveRequest, UpsertEngine, WritePayload};
