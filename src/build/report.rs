//! Step-reporting contract between the build procedure and the supervisor.
//!
//! The procedure announces phase transitions on stdout or stderr, either as
//! a JSON object:
//!
//! ```text
//! {"step": "BUILD", "progress": 50, "message": "compiling pages"}
//! ```
//!
//! (optionally preceded by other text on the same line), or as a tagged line:
//!
//! ```text
//! [STEP DEPS] installing packages
//! [STEP BUILD 62] bundling client
//! ```
//!
//! `ProgressTracker` turns reports into record updates while keeping steps
//! ordered and progress non-decreasing.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use super::log_sink::strip_ansi;
use super::models::BuildStep;

static STEP_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[STEP\s+([A-Za-z]+)(?:\s+(\d{1,3})%?)?\]\s*(.*)$").unwrap()
});

/// One inbound step/progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: BuildStep,
    pub progress: Option<u8>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportJson {
    step: String,
    #[serde(default)]
    progress: Option<u32>,
    #[serde(default)]
    message: Option<String>,
}

impl ReportJson {
    fn into_report(self) -> Option<StepReport> {
        let step = self.step.parse::<BuildStep>().ok()?;
        Some(StepReport {
            step,
            progress: self.progress.map(|p| p.min(100) as u8),
            message: self.message.filter(|m| !m.trim().is_empty()),
        })
    }
}

/// Parse a line of procedure output into a step report, if it is one.
pub fn parse_report(line: &str) -> Option<StepReport> {
    let cleaned = strip_ansi(line);
    let trimmed = cleaned.trim();

    if let Some(caps) = STEP_TAG_REGEX.captures(trimmed) {
        let step = caps.get(1)?.as_str().parse::<BuildStep>().ok()?;
        let progress = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map(|p| p.min(100) as u8);
        let message = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .filter(|m| !m.is_empty());
        return Some(StepReport {
            step,
            progress,
            message,
        });
    }

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<ReportJson>(trimmed) {
        return json.into_report();
    }

    // Then a JSON object embedded in the line
    if let Some(start) = trimmed.find('{')
        && let Some(end) = trimmed.rfind('}')
        && end > start
        && let Ok(json) = serde_json::from_str::<ReportJson>(&trimmed[start..=end])
    {
        return json.into_report();
    }

    None
}

/// Result of applying an accepted report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub step: BuildStep,
    pub progress: u8,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReportRejected {
    #[error("step {to} reported after {from}; steps never go backwards")]
    StepRegressed { from: BuildStep, to: BuildStep },
}

/// Tracks the current step, progress, and per-step timing of one build.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    step: BuildStep,
    progress: u8,
    step_started_at: DateTime<Utc>,
    /// Seconds spent in steps already left behind.
    timings: BTreeMap<BuildStep, f64>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            step: BuildStep::Init,
            progress: 0,
            step_started_at: now,
            timings: BTreeMap::new(),
        }
    }

    pub fn step(&self) -> BuildStep {
        self.step
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Apply a report. Progress is clamped into the step's range and never
    /// decreases; skipped steps are fine, going back is not.
    pub fn apply(&mut self, report: StepReport) -> Result<ProgressUpdate, ReportRejected> {
        self.apply_at(report, Utc::now())
    }

    /// [`apply`](Self::apply) with an explicit clock reading.
    pub fn apply_at(
        &mut self,
        report: StepReport,
        now: DateTime<Utc>,
    ) -> Result<ProgressUpdate, ReportRejected> {
        if report.step < self.step {
            return Err(ReportRejected::StepRegressed {
                from: self.step,
                to: report.step,
            });
        }
        let (lo, hi) = report.step.range();
        let requested = report.progress.unwrap_or(lo).clamp(lo, hi);
        let progress = requested.max(self.progress);

        if report.step != self.step {
            *self.timings.entry(self.step).or_default() += seconds_between(self.step_started_at, now);
            self.step_started_at = now;
        }
        self.step = report.step;
        self.progress = progress;
        Ok(ProgressUpdate {
            step: report.step,
            progress,
            message: report.message,
        })
    }

    /// Seconds per step so far, counting the current step up to `now`.
    pub fn timings_at(&self, now: DateTime<Utc>) -> BTreeMap<BuildStep, f64> {
        let mut timings = self.timings.clone();
        *timings.entry(self.step).or_default() += seconds_between(self.step_started_at, now);
        timings
            .into_iter()
            .map(|(step, secs)| (step, (secs * 100.0).round() / 100.0))
            .collect()
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(step: BuildStep, progress: Option<u8>) -> StepReport {
        StepReport {
            step,
            progress,
            message: None,
        }
    }

    #[test]
    fn test_parse_tagged_line() {
        let parsed = parse_report("[STEP DEPS] installing packages").unwrap();
        assert_eq!(parsed.step, BuildStep::Deps);
        assert_eq!(parsed.progress, None);
        assert_eq!(parsed.message.as_deref(), Some("installing packages"));

        let parsed = parse_report("[STEP build 62%] bundling").unwrap();
        assert_eq!(parsed.step, BuildStep::Build);
        assert_eq!(parsed.progress, Some(62));
    }

    #[test]
    fn test_parse_tagged_line_with_ansi() {
        let parsed = parse_report("\x1b[32m[STEP VERIFY 95]\x1b[0m checking output").unwrap();
        assert_eq!(parsed.step, BuildStep::Verify);
        assert_eq!(parsed.progress, Some(95));
        assert_eq!(parsed.message.as_deref(), Some("checking output"));
    }

    #[test]
    fn test_parse_json_report() {
        let parsed = parse_report(r#"{"step":"BUILD","progress":50,"message":"compiling"}"#).unwrap();
        assert_eq!(
            parsed,
            StepReport {
                step: BuildStep::Build,
                progress: Some(50),
                message: Some("compiling".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_embedded_json_report() {
        let parsed =
            parse_report(r#"2026-01-01T00:00:00Z progress {"step": "config", "progress": 400}"#)
                .unwrap();
        assert_eq!(parsed.step, BuildStep::Config);
        assert_eq!(parsed.progress, Some(100));
        assert!(parsed.message.is_none());
    }

    #[test]
    fn test_parse_ignores_ordinary_output() {
        assert!(parse_report("webpack compiled successfully").is_none());
        assert!(parse_report(r#"{"level":"info","msg":"hello"}"#).is_none());
        assert!(parse_report(r#"{"step":"DEPLOY"}"#).is_none());
        assert!(parse_report("[STEP] missing name").is_none());
        assert!(parse_report("").is_none());
    }

    #[test]
    fn test_tracker_defaults_to_step_lower_bound() {
        let mut tracker = ProgressTracker::new();
        let update = tracker.apply(report(BuildStep::Deps, None)).unwrap();
        assert_eq!(update.progress, 10);
        assert_eq!(tracker.step(), BuildStep::Deps);
    }

    #[test]
    fn test_tracker_clamps_into_step_range() {
        let mut tracker = ProgressTracker::new();
        let update = tracker.apply(report(BuildStep::Init, Some(40))).unwrap();
        assert_eq!(update.progress, 5);

        let update = tracker.apply(report(BuildStep::Build, Some(1))).unwrap();
        assert_eq!(update.progress, 35);
    }

    #[test]
    fn test_tracker_progress_never_decreases() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(report(BuildStep::Build, Some(70))).unwrap();
        let update = tracker.apply(report(BuildStep::Build, Some(50))).unwrap();
        assert_eq!(update.progress, 70);
        assert_eq!(tracker.progress(), 70);
    }

    #[test]
    fn test_tracker_rejects_backwards_step() {
        let mut tracker = ProgressTracker::new();
        tracker.apply(report(BuildStep::Build, Some(60))).unwrap();
        let err = tracker.apply(report(BuildStep::Deps, None)).unwrap_err();
        assert_eq!(
            err,
            ReportRejected::StepRegressed {
                from: BuildStep::Build,
                to: BuildStep::Deps
            }
        );
        assert_eq!(tracker.step(), BuildStep::Build);
        assert_eq!(tracker.progress(), 60);
    }

    #[test]
    fn test_tracker_full_sequence_is_monotonic() {
        let mut tracker = ProgressTracker::new();
        let mut last = 0;
        for step in BuildStep::ALL {
            let update = tracker.apply(report(step, None)).unwrap();
            assert!(update.progress >= last);
            last = update.progress;
        }
        assert_eq!(last, 100);
        assert_eq!(tracker.step(), BuildStep::Complete);
    }

    #[test]
    fn test_tracker_times_each_step() {
        let start = Utc::now();
        let at = |secs: i64| start + chrono::Duration::seconds(secs);
        let mut tracker = ProgressTracker::starting_at(start);

        tracker.apply_at(report(BuildStep::Deps, None), at(2)).unwrap();
        tracker.apply_at(report(BuildStep::Deps, Some(20)), at(5)).unwrap();
        tracker.apply_at(report(BuildStep::Build, None), at(12)).unwrap();
        // Rejected reports do not disturb the clock.
        tracker.apply_at(report(BuildStep::Init, None), at(13)).unwrap_err();

        let timings = tracker.timings_at(at(30));
        assert_eq!(timings.get(&BuildStep::Init), Some(&2.0));
        assert_eq!(timings.get(&BuildStep::Deps), Some(&10.0));
        assert_eq!(timings.get(&BuildStep::Build), Some(&18.0));
        assert!(!timings.contains_key(&BuildStep::Clean));
    }
}
