use crate::core::{Result, SyncError};
use std::time::Duration;

/// Default number of records fetched per window
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default number of tasks running at once
pub const DEFAULT_WORKERS: usize = 3;

/// Pause after each record when dry-run is switched on without a pacing
pub const DEFAULT_DRY_RUN_PACING: Duration = Duration::from_secs(1);

/// Dry-run mode: writes and index creations are computed and logged but never
/// applied, and the batch driver pauses for `pacing` after every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DryRun {
    pub enabled: bool,
    pub pacing: Duration,
}

impl Default for DryRun {
    fn default() -> Self {
        Self {
            enabled: false,
            pacing: DEFAULT_DRY_RUN_PACING,
        }
    }
}

impl DryRun {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(pacing: Duration) -> Self {
        Self {
            enabled: true,
            pacing,
        }
    }

    /// Pause between records, if dry-run is on
    pub fn pacing_delay(&self) -> Option<Duration> {
        (self.enabled && !self.pacing.is_zero()).then_some(self.pacing)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window size applied to bindings that don't set their own
    pub batch_size: u64,
    /// Worker count used by `SyncEngine::run_default`
    pub workers: usize,
    pub dry_run: DryRun,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            dry_run: DryRun::disabled(),
        }
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.batch_size = size;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn dry_run(mut self, pacing: Duration) -> Self {
        self.dry_run = DryRun::enabled(pacing);
        self
    }

    /// Switch dry-run on, keeping the configured pacing
    pub fn enable_dry_run(mut self) -> Self {
        self.dry_run.enabled = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch_size must be > 0".to_string()));
        }
        if self.workers == 0 {
            return Err(SyncError::InvalidConfig("workers must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
