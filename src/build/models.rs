use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BuildError;

/// Upper bound accepted for `workers`.
pub const MAX_WORKERS: u32 = 16;
/// Upper bound (MB) accepted for `max_old_space_size`.
pub const MAX_OLD_SPACE_MB: u32 = 32768;
/// Upper bound (MB) accepted for `max_semi_space_size`.
pub const MAX_SEMI_SPACE_MB: u32 = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Error,
    Killed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Killed => "killed",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Killed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "killed" => Ok(Self::Killed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Check whether a status transition is allowed.
///
/// Non-terminal statuses may be rewritten with themselves (progress updates);
/// terminal statuses accept nothing.
pub fn is_valid_transition(from: BuildStatus, to: BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Pending, Pending)
            | (Pending, Running)
            | (Pending, Error)
            | (Pending, Killed)
            | (Running, Running)
            | (Running, Success)
            | (Running, Error)
            | (Running, Killed)
    )
}

/// Ordered build phases. The declaration order is the execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStep {
    Init,
    Clean,
    Deps,
    Checks,
    Config,
    Build,
    Verify,
    Complete,
}

impl BuildStep {
    pub const ALL: [BuildStep; 8] = [
        Self::Init,
        Self::Clean,
        Self::Deps,
        Self::Checks,
        Self::Config,
        Self::Build,
        Self::Verify,
        Self::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Clean => "CLEAN",
            Self::Deps => "DEPS",
            Self::Checks => "CHECKS",
            Self::Config => "CONFIG",
            Self::Build => "BUILD",
            Self::Verify => "VERIFY",
            Self::Complete => "COMPLETE",
        }
    }

    /// Status line used when a report carries no message of its own.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Init => "Initializing build",
            Self::Clean => "Cleaning previous build artifacts",
            Self::Deps => "Installing dependencies",
            Self::Checks => "Checking backing services",
            Self::Config => "Configuring build",
            Self::Build => "Building application",
            Self::Verify => "Verifying build output",
            Self::Complete => "Build complete",
        }
    }

    /// Inclusive progress sub-range owned by this step.
    pub fn range(&self) -> (u8, u8) {
        match self {
            Self::Init => (0, 5),
            Self::Clean => (5, 10),
            Self::Deps => (10, 25),
            Self::Checks => (25, 30),
            Self::Config => (30, 35),
            Self::Build => (35, 90),
            Self::Verify => (90, 99),
            Self::Complete => (100, 100),
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == upper)
            .ok_or_else(|| format!("Invalid build step: {}", s))
    }
}

/// Failure categories produced by the error classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    OutOfMemory,
    ConnectionError,
    ModuleNotFound,
    SyntaxError,
    TypeError,
    BuildError,
    Interrupted,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ModuleNotFound => "MODULE_NOT_FOUND",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::TypeError => "TYPE_ERROR",
            Self::BuildError => "BUILD_ERROR",
            Self::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    Quick,
    #[default]
    Full,
    Phased,
    PhasedProd,
    Clean,
    RamOptimized,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Full => "full",
            Self::Phased => "phased",
            Self::PhasedProd => "phased-prod",
            Self::Clean => "clean",
            Self::RamOptimized => "ram-optimized",
        }
    }

    /// Value passed to the procedure as `BUILD_MODE`.
    fn procedure_mode(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Phased | Self::PhasedProd => "phased",
            Self::Full | Self::Clean | Self::RamOptimized => "full",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "full" => Ok(Self::Full),
            "phased" => Ok(Self::Phased),
            "phased-prod" => Ok(Self::PhasedProd),
            "clean" => Ok(Self::Clean),
            "ram-optimized" => Ok(Self::RamOptimized),
            _ => Err(format!("Invalid build mode: {}", s)),
        }
    }
}

/// Options frozen into a build's `config_snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    pub mode: BuildMode,
    pub workers: Option<u32>,
    pub max_old_space_size: Option<u32>,
    pub max_semi_space_size: Option<u32>,
    pub skip_deps: bool,
    pub force_clean: bool,
    pub test_database: bool,
    pub test_redis: bool,
    pub skip_type_check: bool,
    pub source_maps: bool,
    pub experimental_flags: Vec<String>,
    pub features: BTreeMap<String, bool>,
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), BuildError> {
        if let Some(workers) = self.workers
            && workers > MAX_WORKERS
        {
            return Err(BuildError::InvalidConfig(format!(
                "workers must be between 0 and {}, got {}",
                MAX_WORKERS, workers
            )));
        }
        if let Some(mb) = self.max_old_space_size
            && mb > MAX_OLD_SPACE_MB
        {
            return Err(BuildError::InvalidConfig(format!(
                "max_old_space_size must be between 0 and {}, got {}",
                MAX_OLD_SPACE_MB, mb
            )));
        }
        if let Some(mb) = self.max_semi_space_size
            && mb > MAX_SEMI_SPACE_MB
        {
            return Err(BuildError::InvalidConfig(format!(
                "max_semi_space_size must be between 0 and {}, got {}",
                MAX_SEMI_SPACE_MB, mb
            )));
        }
        for name in self.features.keys() {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(BuildError::InvalidConfig(format!(
                    "feature name '{}' may only contain letters, digits, '_' and '-'",
                    name
                )));
            }
        }
        for flag in &self.experimental_flags {
            if flag.contains(',') {
                return Err(BuildError::InvalidConfig(format!(
                    "experimental flag '{}' must not contain ','",
                    flag
                )));
            }
        }
        Ok(())
    }

    pub fn is_quick(&self) -> bool {
        self.mode == BuildMode::Quick
    }

    fn cleans(&self) -> bool {
        self.force_clean || self.mode == BuildMode::Clean
    }

    fn skips_deps(&self) -> bool {
        self.skip_deps || self.is_quick()
    }

    fn tests_database(&self) -> bool {
        self.test_database || self.mode == BuildMode::PhasedProd
    }

    fn tests_redis(&self) -> bool {
        self.test_redis || self.mode == BuildMode::PhasedProd
    }

    /// Worker count for this run: the explicit value when non-zero,
    /// otherwise half the available CPUs clamped to 2..=16.
    pub fn effective_workers(&self) -> u32 {
        match self.workers {
            Some(n) if n > 0 => n,
            _ => default_workers(),
        }
    }

    /// Steps the procedure is expected to walk through for this configuration.
    pub fn planned_steps(&self) -> Vec<BuildStep> {
        BuildStep::ALL
            .iter()
            .copied()
            .filter(|step| match step {
                BuildStep::Clean => self.cleans(),
                BuildStep::Deps => !self.skips_deps(),
                BuildStep::Checks => {
                    !self.is_quick() && (self.tests_database() || self.tests_redis())
                }
                _ => true,
            })
            .collect()
    }

    /// Invocation environment handed to the build procedure.
    pub fn to_env(&self, build_id: &str, worker_count: u32) -> Vec<(String, String)> {
        let flag = |b: bool| if b { "true" } else { "false" }.to_string();
        let mut env = vec![
            ("BUILD_ID".to_string(), build_id.to_string()),
            (
                "BUILD_MODE".to_string(),
                self.mode.procedure_mode().to_string(),
            ),
            ("SKIP_DEPS".to_string(), flag(self.skips_deps())),
            ("FORCE_CLEAN".to_string(), flag(self.cleans())),
            ("QUICK_BUILD".to_string(), flag(self.is_quick())),
            (
                "FORCE_FULL_BUILD".to_string(),
                flag(matches!(self.mode, BuildMode::Full | BuildMode::Clean)),
            ),
            ("TEST_DATABASE".to_string(), flag(self.tests_database())),
            ("TEST_REDIS".to_string(), flag(self.tests_redis())),
            ("SKIP_TYPE_CHECK".to_string(), flag(self.skip_type_check)),
            ("SOURCE_MAPS".to_string(), flag(self.source_maps)),
            ("BUILD_WORKERS".to_string(), worker_count.to_string()),
            ("CI".to_string(), "true".to_string()),
        ];

        let mut node_options = Vec::new();
        if let Some(mb) = self.max_old_space_size.filter(|mb| *mb > 0) {
            env.push(("MAX_OLD_SPACE".to_string(), mb.to_string()));
            node_options.push(format!("--max-old-space-size={}", mb));
        }
        if let Some(mb) = self.max_semi_space_size.filter(|mb| *mb > 0) {
            env.push(("MAX_SEMI_SPACE".to_string(), mb.to_string()));
            node_options.push(format!("--max-semi-space-size={}", mb));
        }
        if !node_options.is_empty() {
            env.push(("NODE_OPTIONS".to_string(), node_options.join(" ")));
        }
        if !self.experimental_flags.is_empty() {
            env.push((
                "EXPERIMENTAL_FLAGS".to_string(),
                self.experimental_flags.join(","),
            ));
        }
        for (name, enabled) in &self.features {
            let key = format!("FEATURE_{}", name.to_ascii_uppercase().replace('-', "_"));
            env.push((key, flag(*enabled)));
        }
        env
    }
}

fn default_workers() -> u32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4);
    (cpus / 2).clamp(2, MAX_WORKERS)
}

/// One build attempt, as persisted in the status store and in history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildRecord {
    pub build_id: String,
    pub environment: String,
    pub status: BuildStatus,
    pub current_step: BuildStep,
    pub progress: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config_snapshot: BuildConfig,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub duration_seconds: Option<f64>,
    pub build_size_bytes: Option<u64>,
    /// Seconds spent in each reported step.
    #[serde(default)]
    pub step_timings: BTreeMap<BuildStep, f64>,
    pub worker_count: u32,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub kill_requested: bool,
    pub log_path: PathBuf,
}

impl BuildRecord {
    pub fn new(
        build_id: impl Into<String>,
        environment: impl Into<String>,
        config: BuildConfig,
        log_path: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        let worker_count = config.effective_workers();
        Self {
            build_id: build_id.into(),
            environment: environment.into(),
            status: BuildStatus::Pending,
            current_step: BuildStep::Init,
            progress: 0,
            message: "Build queued".to_string(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            config_snapshot: config,
            error: None,
            error_type: None,
            duration_seconds: None,
            build_size_bytes: None,
            step_timings: BTreeMap::new(),
            worker_count,
            pid: None,
            exit_code: None,
            kill_requested: false,
            log_path,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The step that took longest, if any were timed.
    pub fn slowest_step(&self) -> Option<(BuildStep, f64)> {
        self.step_timings
            .iter()
            .map(|(step, secs)| (*step, *secs))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Move to a terminal status, stamping `completed_at` and the duration.
    pub fn finish(&mut self, status: BuildStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        let millis = (now - self.started_at).num_milliseconds().max(0);
        self.duration_seconds = Some((millis as f64 / 10.0).round() / 100.0);
    }

    /// Terminal error with a classified category.
    pub fn fail(
        &mut self,
        error_type: ErrorType,
        message: impl Into<String>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.message = message.into();
        self.error = Some(error.into());
        self.error_type = Some(error_type);
        self.finish(BuildStatus::Error, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Error,
            BuildStatus::Killed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("finished".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Error.is_terminal());
        assert!(BuildStatus::Killed.is_terminal());
    }

    #[test]
    fn test_terminal_status_never_transitions() {
        for from in [BuildStatus::Success, BuildStatus::Error, BuildStatus::Killed] {
            for to in [
                BuildStatus::Pending,
                BuildStatus::Running,
                BuildStatus::Success,
                BuildStatus::Error,
                BuildStatus::Killed,
            ] {
                assert!(!is_valid_transition(from, to), "{} -> {}", from, to);
            }
        }
        assert!(is_valid_transition(BuildStatus::Pending, BuildStatus::Running));
        assert!(is_valid_transition(BuildStatus::Running, BuildStatus::Killed));
        assert!(!is_valid_transition(BuildStatus::Running, BuildStatus::Pending));
    }

    #[test]
    fn test_step_ranges_are_ordered_and_contiguous() {
        let mut previous_upper = 0;
        for step in BuildStep::ALL {
            let (lo, hi) = step.range();
            assert!(lo <= hi);
            assert!(lo >= previous_upper, "{} starts before previous step", step);
            previous_upper = hi;
        }
        assert_eq!(BuildStep::Complete.range(), (100, 100));
    }

    #[test]
    fn test_step_parse_is_case_insensitive() {
        assert_eq!("build".parse::<BuildStep>().unwrap(), BuildStep::Build);
        assert_eq!(" VERIFY ".parse::<BuildStep>().unwrap(), BuildStep::Verify);
        assert!("DEPLOY".parse::<BuildStep>().is_err());
    }

    #[test]
    fn test_error_type_serializes_screaming() {
        let json = serde_json::to_string(&ErrorType::OutOfMemory).unwrap();
        assert_eq!(json, "\"OUT_OF_MEMORY\"");
        let parsed: ErrorType = serde_json::from_str("\"INTERRUPTED\"").unwrap();
        assert_eq!(parsed, ErrorType::Interrupted);
    }

    #[test]
    fn test_build_config_defaults_from_empty_json() {
        let config: BuildConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mode, BuildMode::Full);
        assert!(config.workers.is_none());
        assert!(config.features.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_build_config_parses_kebab_mode() {
        let config: BuildConfig = serde_json::from_str(r#"{"mode": "phased-prod"}"#).unwrap();
        assert_eq!(config.mode, BuildMode::PhasedProd);
    }

    #[test]
    fn test_build_config_validate_rejects_out_of_range() {
        let config = BuildConfig {
            workers: Some(17),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BuildError::InvalidConfig(_))));

        let config = BuildConfig {
            max_old_space_size: Some(40000),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BuildConfig {
            max_semi_space_size: Some(5000),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut features = BTreeMap::new();
        features.insert("bad name".to_string(), true);
        let config = BuildConfig {
            features,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_workers_prefers_explicit_value() {
        let config = BuildConfig {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 3);

        let auto = BuildConfig {
            workers: Some(0),
            ..Default::default()
        };
        let n = auto.effective_workers();
        assert!((2..=MAX_WORKERS).contains(&n));
    }

    #[test]
    fn test_planned_steps_quick_mode() {
        let config = BuildConfig {
            mode: BuildMode::Quick,
            test_database: true,
            ..Default::default()
        };
        assert_eq!(
            config.planned_steps(),
            vec![
                BuildStep::Init,
                BuildStep::Config,
                BuildStep::Build,
                BuildStep::Verify,
                BuildStep::Complete
            ]
        );
    }

    #[test]
    fn test_planned_steps_clean_phased_prod() {
        let config = BuildConfig {
            mode: BuildMode::PhasedProd,
            force_clean: true,
            ..Default::default()
        };
        assert_eq!(config.planned_steps(), BuildStep::ALL.to_vec());
    }

    #[test]
    fn test_to_env_quick_mode() {
        let config = BuildConfig {
            mode: BuildMode::Quick,
            max_old_space_size: Some(4096),
            experimental_flags: vec!["turbo".to_string(), "swc".to_string()],
            features: BTreeMap::from([("new-ui".to_string(), true)]),
            ..Default::default()
        };
        let env: BTreeMap<String, String> = config.to_env("b-1", 4).into_iter().collect();

        assert_eq!(env["BUILD_ID"], "b-1");
        assert_eq!(env["BUILD_MODE"], "quick");
        assert_eq!(env["SKIP_DEPS"], "true");
        assert_eq!(env["QUICK_BUILD"], "true");
        assert_eq!(env["FORCE_FULL_BUILD"], "false");
        assert_eq!(env["BUILD_WORKERS"], "4");
        assert_eq!(env["MAX_OLD_SPACE"], "4096");
        assert_eq!(env["NODE_OPTIONS"], "--max-old-space-size=4096");
        assert_eq!(env["EXPERIMENTAL_FLAGS"], "turbo,swc");
        assert_eq!(env["FEATURE_NEW_UI"], "true");
        assert_eq!(env["CI"], "true");
        assert!(!env.contains_key("MAX_SEMI_SPACE"));
    }

    #[test]
    fn test_to_env_phased_prod_forces_checks() {
        let config = BuildConfig {
            mode: BuildMode::PhasedProd,
            ..Default::default()
        };
        let env: BTreeMap<String, String> = config.to_env("b-2", 2).into_iter().collect();
        assert_eq!(env["BUILD_MODE"], "phased");
        assert_eq!(env["TEST_DATABASE"], "true");
        assert_eq!(env["TEST_REDIS"], "true");
        assert_eq!(env["FORCE_CLEAN"], "false");
    }

    #[test]
    fn test_new_record_is_pending_at_init() {
        let now = Utc::now();
        let record = BuildRecord::new(
            "b-3",
            "dev",
            BuildConfig::default(),
            PathBuf::from("/tmp/b-3.log"),
            now,
        );
        assert_eq!(record.status, BuildStatus::Pending);
        assert_eq!(record.current_step, BuildStep::Init);
        assert_eq!(record.progress, 0);
        assert_eq!(record.started_at, now);
        assert!(record.completed_at.is_none());
        assert!(record.worker_count >= 2);
    }

    #[test]
    fn test_step_timings_serialize_by_step_name() {
        let mut record = BuildRecord::new(
            "b-5",
            "dev",
            BuildConfig::default(),
            PathBuf::from("/tmp/b-5.log"),
            Utc::now(),
        );
        assert!(record.slowest_step().is_none());
        record.step_timings.insert(BuildStep::Deps, 12.5);
        record.step_timings.insert(BuildStep::Build, 40.25);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["step_timings"]["BUILD"], 40.25);
        assert_eq!(json["step_timings"]["DEPS"], 12.5);
        assert_eq!(record.slowest_step(), Some((BuildStep::Build, 40.25)));

        let parsed: BuildRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.step_timings, record.step_timings);
    }

    #[test]
    fn test_record_without_step_timings_still_parses() {
        let record = BuildRecord::new(
            "b-6",
            "dev",
            BuildConfig::default(),
            PathBuf::from("/tmp/b-6.log"),
            Utc::now(),
        );
        let mut json = serde_json::to_value(&record).unwrap();
        json.as_object_mut().unwrap().remove("step_timings");
        let parsed: BuildRecord = serde_json::from_value(json).unwrap();
        assert!(parsed.step_timings.is_empty());
    }

    #[test]
    fn test_fail_sets_terminal_fields() {
        let start = Utc::now();
        let mut record = BuildRecord::new(
            "b-4",
            "dev",
            BuildConfig::default(),
            PathBuf::from("/tmp/b-4.log"),
            start,
        );
        let end = start + chrono::Duration::milliseconds(2500);
        record.fail(ErrorType::OutOfMemory, "Build failed", "heap out of memory", end);

        assert_eq!(record.status, BuildStatus::Error);
        assert_eq!(record.error_type, Some(ErrorType::OutOfMemory));
        assert_eq!(record.completed_at, Some(end));
        assert_eq!(record.duration_seconds, Some(2.5));
        assert!(record.is_terminal());
    }
}
