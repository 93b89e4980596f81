//! Service configuration read from `buildmaster.toml`.
//!
//! Layering is file → environment variables → CLI flags. Relative paths in
//! the file are resolved against the directory that holds the file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8889
//!
//! [storage]
//! data_dir = ".buildmaster"
//!
//! [monitor]
//! default_stall_secs = 600
//! heartbeat_interval_secs = 15
//!
//! [monitor.step_stall_secs]
//! INIT = 300
//! CLEAN = 300
//! BUILD = 600
//!
//! [supervisor]
//! kill_grace_secs = 5
//! error_tail_chars = 3000
//!
//! [history]
//! max_entries = 100
//! max_age_days = 30
//!
//! [logging]
//! dir = "logs"
//! json = false
//!
//! [environments.dev]
//! working_dir = "../app"
//! command = ["./scripts/build.sh"]
//! artifact_dir = ".next"
//!
//! [environments.dev.mode_commands]
//! quick = ["./scripts/build.sh", "--quick"]
//!
//! [environments.dev.env]
//! NODE_ENV = "production"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::build::heartbeat::StallThresholds;
use crate::build::history::Retention;
use crate::build::models::{BuildMode, BuildStep};
use crate::errors::BuildError;

pub const DEFAULT_CONFIG_FILE: &str = "buildmaster.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for a dashboard served from another origin.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8889
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".buildmaster")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_stall_secs")]
    pub default_stall_secs: u64,
    /// Per-step overrides keyed by step name (`INIT`, `BUILD`, ...).
    #[serde(default = "default_step_stall_secs")]
    pub step_stall_secs: BTreeMap<String, u64>,
    /// Minimum spacing between heartbeat writes driven by plain output.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_stall_secs() -> u64 {
    crate::build::heartbeat::DEFAULT_STALL_SECS
}

fn default_step_stall_secs() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("INIT".to_string(), 300),
        ("CLEAN".to_string(), 300),
        ("BUILD".to_string(), 600),
    ])
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            default_stall_secs: default_stall_secs(),
            step_stall_secs: default_step_stall_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Seconds between SIGTERM and SIGKILL when killing a build.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Characters of log tail handed to the classifier.
    #[serde(default = "default_error_tail_chars")]
    pub error_tail_chars: usize,
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_error_tail_chars() -> usize {
    3000
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            kill_grace_secs: default_kill_grace_secs(),
            error_tail_chars: default_error_tail_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

fn default_max_entries() -> usize {
    100
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_age_days: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily-rotated log files; stderr only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// How to run the build procedure for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Per-mode argv overrides keyed by mode name (`quick`, `phased-prod`, ...).
    #[serde(default)]
    pub mode_commands: BTreeMap<String, Vec<String>>,
    /// Build output measured for `build_size_bytes`, relative to `working_dir`.
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    /// Extra variables for the procedure's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl EnvironmentConfig {
    pub fn new(working_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            command,
            mode_commands: BTreeMap::new(),
            artifact_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Argv for `mode`, falling back to the default command.
    pub fn command_for(&self, mode: BuildMode) -> &[String] {
        self.mode_commands
            .get(mode.as_str())
            .filter(|argv| !argv.is_empty())
            .unwrap_or(&self.command)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    base_dir: PathBuf,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildmaster.toml")
    }

    /// Load `path` if it exists, otherwise defaults rooted at the current directory.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Apply `BUILDMASTER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("BUILDMASTER_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("BUILDMASTER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("BUILDMASTER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("BUILDMASTER_PORT is not a valid port: {}", port))?;
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.storage.data_dir)
    }

    pub fn status_dir(&self) -> PathBuf {
        self.data_dir().join("status")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir().join("history")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir().join("locks")
    }

    pub fn log_file_dir(&self) -> Option<PathBuf> {
        self.logging.dir.as_deref().map(|dir| self.resolve(dir))
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, BuildError> {
        self.environments
            .get(name)
            .ok_or_else(|| BuildError::UnknownEnvironment {
                environment: name.to_string(),
            })
    }

    pub fn stall_thresholds(&self) -> StallThresholds {
        let mut thresholds =
            StallThresholds::new(Duration::from_secs(self.monitor.default_stall_secs));
        for (name, secs) in &self.monitor.step_stall_secs {
            if let Ok(step) = name.parse::<BuildStep>() {
                thresholds = thresholds.with_step(step, Duration::from_secs(*secs));
            }
        }
        thresholds
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.heartbeat_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.kill_grace_secs)
    }

    pub fn retention(&self) -> Retention {
        Retention {
            max_entries: self.history.max_entries,
            max_age: self
                .history
                .max_age_days
                .map(|days| chrono::Duration::days(days as i64)),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.monitor.default_stall_secs == 0 {
            warnings.push("monitor.default_stall_secs is 0: every running build reads as stalled".to_string());
        }
        for (name, secs) in &self.monitor.step_stall_secs {
            if name.parse::<BuildStep>().is_err() {
                warnings.push(format!(
                    "Unknown step '{}' in monitor.step_stall_secs (valid: {})",
                    name,
                    BuildStep::ALL.map(|s| s.as_str()).join(", ")
                ));
            } else if *secs == 0 {
                warnings.push(format!("monitor.step_stall_secs.{} is 0", name));
            }
        }
        if self.supervisor.error_tail_chars == 0 {
            warnings.push("supervisor.error_tail_chars is 0: failures cannot be classified".to_string());
        }
        if self.history.max_entries == 0 {
            warnings.push("history.max_entries is 0: no build history will be kept".to_string());
        }
        if self.environments.is_empty() {
            warnings.push("No environments configured: builds cannot be started".to_string());
        }
        for (name, env) in &self.environments {
            if !crate::build::lock::is_valid_environment(name) {
                warnings.push(format!(
                    "Environment name '{}' may only contain letters, digits, '_' and '-'",
                    name
                ));
            }
            if env.command.is_empty() {
                warnings.push(format!("environments.{}.command is empty", name));
            }
            for mode in env.mode_commands.keys() {
                if mode.parse::<BuildMode>().is_err() {
                    warnings.push(format!(
                        "Unknown build mode '{}' in environments.{}.mode_commands",
                        mode, name
                    ));
                }
            }
            let working_dir = self.resolve(&env.working_dir);
            if !working_dir.is_dir() {
                warnings.push(format!(
                    "environments.{}.working_dir does not exist: {}",
                    name,
                    working_dir.display()
                ));
            }
        }

        warnings
    }
}
