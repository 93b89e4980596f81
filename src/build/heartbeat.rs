//! Stall detection derived from a record's last update time.
//!
//! Nothing here runs in the background: `is_stalled` is evaluated when a
//! record is read, and a stalled build is only ever reported, never killed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::models::{BuildRecord, BuildStatus, BuildStep};

pub const DEFAULT_STALL_SECS: u64 = 600;

/// Per-step stall thresholds with a fallback for steps without an override.
#[derive(Debug, Clone)]
pub struct StallThresholds {
    default: Duration,
    per_step: HashMap<BuildStep, Duration>,
}

impl Default for StallThresholds {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_STALL_SECS))
            .with_step(BuildStep::Init, Duration::from_secs(300))
            .with_step(BuildStep::Clean, Duration::from_secs(300))
            .with_step(BuildStep::Build, Duration::from_secs(DEFAULT_STALL_SECS))
    }
}

impl StallThresholds {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_step: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: BuildStep, threshold: Duration) -> Self {
        self.per_step.insert(step, threshold);
        self
    }

    pub fn for_step(&self, step: BuildStep) -> Duration {
        self.per_step.get(&step).copied().unwrap_or(self.default)
    }
}

/// True iff the build is running and has not been updated for longer than `threshold`.
pub fn is_stalled(record: &BuildRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
    if record.status != BuildStatus::Running {
        return false;
    }
    let idle = now - record.updated_at;
    match chrono::Duration::from_std(threshold) {
        Ok(limit) => idle > limit,
        Err(_) => false,
    }
}

/// Stall evaluation attached to API views.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StallCheck {
    pub stalled: bool,
    pub stall_threshold_secs: u64,
    pub idle_secs: i64,
}

pub fn check(record: &BuildRecord, now: DateTime<Utc>, thresholds: &StallThresholds) -> StallCheck {
    let threshold = thresholds.for_step(record.current_step);
    StallCheck {
        stalled: is_stalled(record, now, threshold),
        stall_threshold_secs: threshold.as_secs(),
        idle_secs: (now - record.updated_at).num_seconds().max(0),
    }
}
