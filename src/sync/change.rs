//! Field-level change detection
//!
//! A field counts as changed when it is missing from the existing record, or
//! when the existing value (including `false`, `0` or `null`) differs from the
//! candidate's. Checked columns are evaluated first; when none of them signals
//! a change, every field of the candidate is evaluated.

use crate::core::{Record, Result};
use serde_json::Value;
use tracing::debug;

/// Decides whether a candidate record differs from the stored one
pub trait ChangeDetector: Send + Sync {
    /// `Err` means the comparison itself failed; callers treat that as changed.
    fn has_changed(
        &self,
        old: &Record,
        new: &Record,
        columns: &[String],
        exclude: &[String],
    ) -> Result<bool>;
}

/// Plain field-by-field comparison
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldChangeDetector;

impl ChangeDetector for FieldChangeDetector {
    fn has_changed(
        &self,
        old: &Record,
        new: &Record,
        columns: &[String],
        exclude: &[String],
    ) -> Result<bool> {
        Ok(has_changed(old, new, columns, exclude))
    }
}

pub fn has_changed(old: &Record, new: &Record, columns: &[String], exclude: &[String]) -> bool {
    let excluded = |field: &str| exclude.iter().any(|e| e == field);

    for column in columns.iter().filter(|c| !excluded(c.as_str())) {
        if field_changed(old, new, column) {
            return true;
        }
    }

    new.keys()
        .filter(|field| !excluded(field.as_str()))
        .any(|field| field_changed(old, new, field))
}

/// A field absent from `new` compares as `null`.
fn field_changed(old: &Record, new: &Record, field: &str) -> bool {
    let Some(previous) = old.get(field) else {
        debug!("field '{}' missing from existing record", field);
        return true;
    };

    let current = new.get(field).unwrap_or(&Value::Null);
    if previous != current {
        debug!("field '{}' changed: old={} new={}", field, previous, current);
        return true;
    }
    false
}
