//! Build supervision.
//!
//! `BuildSupervisor` launches one build procedure per environment, pumps its
//! output into the log sink and its step reports into the status store, and
//! finalizes the record when the process exits. It also reconciles records
//! left behind by a supervisor that died mid-build.
//!
//! Writers per build id:
//! - the exit watcher spawned by `start` (or by adoption during recovery),
//! - otherwise the reconciler, which only touches records nobody tracks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::errors::BuildError;

use super::classifier::{classify, summarize_failure};
use super::heartbeat::{self, StallThresholds};
use super::history::BuildHistory;
use super::lock::ActiveBuildLock;
use super::log_sink::{LogChunk, LogSink, LogWriter};
use super::models::{BuildConfig, BuildRecord, BuildStatus, BuildStep, ErrorType};
use super::process::{
    Signal, exit_code_of, is_process_alive, isolate_process_group, signal_process_group,
};
use super::report::{ProgressTracker, parse_report};
use super::status_store::StatusStore;

/// A pending record without a pid younger than this is still being spawned.
const STARTING_GRACE: Duration = Duration::from_secs(30);
/// How often an adopted build's pid is checked for liveness.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long to keep reading pipes after the child exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for finalization after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

const LOG_PREFIX: &str = "[buildmaster]";

/// In-memory handle for a build this supervisor is responsible for.
struct BuildHandle {
    build_id: String,
    environment: String,
    /// Process group id; 0 until the child has been spawned.
    pgid: AtomicU32,
    kill_requested: AtomicBool,
    finished: watch::Sender<Option<BuildRecord>>,
}

impl BuildHandle {
    fn new(build_id: &str, environment: &str, pgid: Option<u32>) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            build_id: build_id.to_string(),
            environment: environment.to_string(),
            pgid: AtomicU32::new(pgid.unwrap_or(0)),
            kill_requested: AtomicBool::new(false),
            finished,
        }
    }

    fn pgid(&self) -> Option<u32> {
        match self.pgid.load(Ordering::SeqCst) {
            0 => None,
            pgid => Some(pgid),
        }
    }
}

/// Outcome of [`BuildSupervisor::recover`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Builds whose process was gone; now `error` / `INTERRUPTED`.
    pub interrupted: Vec<String>,
    /// Builds whose process is still alive; now watched by this supervisor.
    pub adopted: Vec<String>,
    /// Environments whose lock pointed at a finished or missing build.
    pub stale_locks: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.adopted.is_empty() && self.stale_locks.is_empty()
    }
}

/// A record plus the values derived from it at read time.
#[derive(Debug, Clone, Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub record: BuildRecord,
    pub stalled: bool,
    pub stall_threshold_secs: u64,
    pub idle_secs: i64,
    pub planned_steps: Vec<BuildStep>,
}

/// Mutable state of one watched build, owned by its exit watcher.
struct WatchedBuild {
    record: BuildRecord,
    tracker: ProgressTracker,
    writer: LogWriter,
    last_write: Instant,
}

struct Inner {
    config: ServiceConfig,
    thresholds: StallThresholds,
    store: StatusStore,
    locks: ActiveBuildLock,
    history: BuildHistory,
    logs_dir: PathBuf,
    running: Mutex<HashMap<String, Arc<BuildHandle>>>,
}

#[derive(Clone)]
pub struct BuildSupervisor {
    inner: Arc<Inner>,
}

impl BuildSupervisor {
    /// Open the on-disk stores under the configured data directory.
    pub fn new(config: ServiceConfig) -> Result<Self, BuildError> {
        let store = StatusStore::open(config.status_dir())?;
        let locks = ActiveBuildLock::open(config.locks_dir())?;
        let history = BuildHistory::open(config.history_dir(), config.retention())?;
        let logs_dir = config.logs_dir();
        std::fs::create_dir_all(&logs_dir).map_err(|e| BuildError::storage(&logs_dir, e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                thresholds: config.stall_thresholds(),
                config,
                store,
                locks,
                history,
                logs_dir,
                running: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Start a build for `environment`. Returns once the procedure is running.
    pub async fn start(
        &self,
        environment: &str,
        config: BuildConfig,
    ) -> Result<BuildRecord, BuildError> {
        Arc::clone(&self.inner).start(environment, config).await
    }

    /// Latest record for `build_id`, reconciling it first if its process is gone.
    pub fn observe(&self, build_id: &str) -> Result<BuildRecord, BuildError> {
        self.inner.observe(build_id)
    }

    /// Record plus stall evaluation.
    pub fn view(&self, record: BuildRecord) -> BuildView {
        let check = heartbeat::check(&record, Utc::now(), &self.inner.thresholds);
        let planned_steps = record.config_snapshot.planned_steps();
        BuildView {
            record,
            stalled: check.stalled,
            stall_threshold_secs: check.stall_threshold_secs,
            idle_secs: check.idle_secs,
            planned_steps,
        }
    }

    /// Terminate a running build's process group and wait for finalization.
    ///
    /// Killing a finished build is a no-op that returns its terminal record.
    pub async fn kill(&self, build_id: &str) -> Result<BuildRecord, BuildError> {
        Arc::clone(&self.inner).kill(build_id).await
    }

    /// Wait until `build_id` reaches a terminal status (or return its current
    /// record if this supervisor is not watching it).
    pub async fn wait(&self, build_id: &str) -> Result<BuildRecord, BuildError> {
        if let Some(handle) = self.inner.tracked(build_id) {
            let mut finished = handle.finished.subscribe();
            if let Ok(record) = finished.wait_for(Option::is_some).await
                && let Some(record) = (*record).clone()
            {
                return Ok(record);
            }
        }
        self.inner.observe(build_id)
    }

    pub fn tail_log(&self, build_id: &str, max_lines: usize) -> Result<Vec<String>, BuildError> {
        let record = self.inner.observe(build_id)?;
        LogSink::new(record.log_path).tail(max_lines)
    }

    pub fn read_log_since(&self, build_id: &str, offset: u64) -> Result<LogChunk, BuildError> {
        let record = self.inner.observe(build_id)?;
        LogSink::new(record.log_path).read_since(offset)
    }

    /// At most `max_lines` complete lines after `offset`.
    pub fn read_log_lines_since(
        &self,
        build_id: &str,
        offset: u64,
        max_lines: usize,
    ) -> Result<LogChunk, BuildError> {
        let record = self.inner.observe(build_id)?;
        LogSink::new(record.log_path).read_lines_since(offset, max_lines)
    }

    /// The non-terminal build holding `environment`, if any.
    pub fn active(&self, environment: &str) -> Result<Option<BuildRecord>, BuildError> {
        self.inner.active(environment)
    }

    pub fn history(&self, environment: &str, limit: usize) -> Result<Vec<BuildRecord>, BuildError> {
        self.inner.history.list(environment, limit)
    }

    /// Reconcile everything a previous supervisor left behind.
    pub fn recover(&self) -> Result<RecoveryReport, BuildError> {
        Arc::clone(&self.inner).recover()
    }

    /// Kill every build this supervisor is watching and wait for each to finalize.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = match self.inner.running.lock() {
            Ok(running) => running.keys().cloned().collect(),
            Err(e) => {
                error!(error = %e, "running-build table poisoned during shutdown");
                return;
            }
        };
        let mut tasks = tokio::task::JoinSet::new();
        for build_id in ids {
            info!(build_id = %build_id, "shutting down build");
            let supervisor = self.clone();
            tasks.spawn(async move {
                if let Err(e) = supervisor.kill(&build_id).await {
                    warn!(build_id = %build_id, error = %e, "failed to kill build during shutdown");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Inner {
    fn tracked(&self, build_id: &str) -> Option<Arc<BuildHandle>> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(build_id).cloned())
    }

    fn is_tracked(&self, build_id: &str) -> bool {
        self.tracked(build_id).is_some()
    }

    /// Register `handle`, or return the handle already registered for its id.
    fn track(&self, handle: Arc<BuildHandle>) -> Result<Arc<BuildHandle>, BuildError> {
        let mut running = self
            .running
            .lock()
            .map_err(|e| anyhow::anyhow!("running-build table poisoned: {}", e))?;
        Ok(Arc::clone(
            running
                .entry(handle.build_id.clone())
                .or_insert(handle),
        ))
    }

    fn untrack(&self, build_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(build_id);
        }
    }

    fn observe(&self, build_id: &str) -> Result<BuildRecord, BuildError> {
        let record = self
            .store
            .read(build_id)?
            .ok_or_else(|| BuildError::NotFound {
                build_id: build_id.to_string(),
            })?;
        self.reconcile_if_orphaned(record)
    }

    /// A non-terminal record that no live process or watcher backs is
    /// finalized as interrupted before anyone sees it.
    fn reconcile_if_orphaned(&self, record: BuildRecord) -> Result<BuildRecord, BuildError> {
        if record.is_terminal() || self.is_tracked(&record.build_id) {
            return Ok(record);
        }
        let pid = record.pid;
        match pid {
            Some(pid) if is_process_alive(pid) => Ok(record),
            Some(_) => self.finalize_interrupted(record),
            None => {
                let age = (Utc::now() - record.updated_at).to_std().unwrap_or_default();
                if age < STARTING_GRACE {
                    Ok(record)
                } else {
                    self.finalize_interrupted(record)
                }
            }
        }
    }

    fn finalize_interrupted(&self, mut record: BuildRecord) -> Result<BuildRecord, BuildError> {
        warn!(
            build_id = %record.build_id,
            environment = %record.environment,
            pid = ?record.pid,
            "build process is gone; marking interrupted"
        );
        let now = Utc::now();
        if record.kill_requested {
            record.message = "Build was cancelled by user".to_string();
            record.finish(BuildStatus::Killed, now);
        } else {
            record.fail(
                ErrorType::Interrupted,
                "Build interrupted: the supervising process stopped before the build finished",
                format!(
                    "Build process {} is no longer running and no exit status was recorded",
                    record
                        .pid
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| "(never started)".to_string())
                ),
                now,
            );
        }
        self.commit_terminal(record)
    }

    /// Write the terminal record, release the environment, and append history.
    ///
    /// If another writer (possibly another supervisor process) already
    /// finalized the build, its record wins and nothing else is touched.
    fn commit_terminal(&self, record: BuildRecord) -> Result<BuildRecord, BuildError> {
        debug_assert!(record.is_terminal());
        match self.store.finalize(&record) {
            Ok(None) => {}
            Ok(Some(current)) => {
                debug!(
                    build_id = %record.build_id,
                    status = %current.status,
                    "build already finalized"
                );
                return Ok(current);
            }
            Err(e) => {
                error!(build_id = %record.build_id, error = %e, "failed to write terminal status");
            }
        }
        if let Err(e) = self.locks.release(&record.environment, &record.build_id) {
            error!(build_id = %record.build_id, error = %e, "failed to release environment lock");
        }
        match self.history.append(&record) {
            Ok(true) => {}
            Ok(false) => debug!(build_id = %record.build_id, "history already had this build"),
            Err(e) => error!(build_id = %record.build_id, error = %e, "failed to append history"),
        }
        info!(
            build_id = %record.build_id,
            environment = %record.environment,
            status = %record.status,
            error_type = ?record.error_type,
            duration_seconds = ?record.duration_seconds,
            "build finished"
        );
        Ok(record)
    }

    /// Remove `environment`'s lock if its holder is finished, missing, or dead.
    fn clear_stale_lock(&self, environment: &str, holder: &str) -> Result<bool, BuildError> {
        if holder.is_empty() || self.is_tracked(holder) {
            return Ok(false);
        }
        let stale = match self.store.read(holder)? {
            None => true,
            Some(record) => self.reconcile_if_orphaned(record)?.is_terminal(),
        };
        if stale && self.locks.release(environment, holder)? {
            info!(environment, holder, "removed stale environment lock");
        }
        Ok(stale)
    }

    fn acquire_slot(&self, environment: &str, build_id: &str) -> Result<(), BuildError> {
        match self.locks.try_acquire(environment, build_id) {
            Err(BuildError::AlreadyRunning {
                environment: env,
                build_id: holder,
            }) => {
                if self.clear_stale_lock(&env, &holder)? {
                    self.locks.try_acquire(environment, build_id)
                } else {
                    Err(BuildError::AlreadyRunning {
                        environment: env,
                        build_id: holder,
                    })
                }
            }
            other => other,
        }
    }

    fn active(&self, environment: &str) -> Result<Option<BuildRecord>, BuildError> {
        let Some(holder) = self.locks.holder(environment)? else {
            return Ok(None);
        };
        if holder.is_empty() {
            return Ok(None);
        }
        match self.store.read(&holder)? {
            Some(record) => {
                let record = self.reconcile_if_orphaned(record)?;
                if record.is_terminal() {
                    self.clear_stale_lock(environment, &holder)?;
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
            None => {
                self.clear_stale_lock(environment, &holder)?;
                Ok(None)
            }
        }
    }

    async fn start(
        self: Arc<Self>,
        environment: &str,
        config: BuildConfig,
    ) -> Result<BuildRecord, BuildError> {
        let env_config = self.config.environment(environment)?.clone();
        config.validate()?;
        let argv = env_config.command_for(config.mode).to_vec();
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildError::InvalidConfig(format!(
                "environment '{}' has no build command",
                environment
            )));
        };

        let build_id = Uuid::new_v4().to_string();
        self.acquire_slot(environment, &build_id)?;
        let handle = self.track(Arc::new(BuildHandle::new(&build_id, environment, None)))?;

        let sink = LogSink::for_build(&self.logs_dir, &build_id);
        let mut record = BuildRecord::new(
            &build_id,
            environment,
            config,
            sink.path().to_path_buf(),
            Utc::now(),
        );
        if let Err(e) = self.store.write(&record) {
            self.untrack(&build_id);
            let _ = self.locks.release(environment, &build_id);
            return Err(e);
        }
        info!(
            build_id = %build_id,
            environment,
            command = ?argv,
            mode = %record.config_snapshot.mode,
            workers = record.worker_count,
            "build queued"
        );

        let mut writer = match sink.writer().await {
            Ok(writer) => writer,
            Err(e) => {
                self.fail_before_spawn(record, &handle, format!("Failed to open build log: {}", e));
                return Err(e);
            }
        };
        let header = [
            format!(
                "{} Build {} for environment '{}' (mode {}, {} workers)",
                LOG_PREFIX, build_id, environment, record.config_snapshot.mode, record.worker_count
            ),
            format!("{} Command: {}", LOG_PREFIX, program),
            format!("{} Started at {}", LOG_PREFIX, record.started_at.to_rfc3339()),
        ];
        for line in &header {
            if let Err(e) = writer.append_line(line).await {
                warn!(build_id = %build_id, error = %e, "failed to write log header");
            }
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.config.resolve(&env_config.working_dir))
            .envs(&env_config.env)
            .envs(record.config_snapshot.to_env(&build_id, record.worker_count))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let text = format!(
                    "Failed to start build procedure '{}': {}",
                    argv.join(" "),
                    source
                );
                let _ = writer.append_line(&format!("{} {}", LOG_PREFIX, text)).await;
                self.fail_before_spawn(record, &handle, text);
                return Err(BuildError::SpawnFailed { build_id, source });
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            handle.pgid.store(pid, Ordering::SeqCst);
        }
        record.status = BuildStatus::Running;
        record.pid = pid;
        record.message = "Build started".to_string();
        record.updated_at = Utc::now();
        if let Err(e) = self.store.write(&record) {
            warn!(build_id = %build_id, error = %e, "failed to record running status");
        }
        info!(build_id = %build_id, environment, pid = ?pid, "build started");

        // A kill that arrived while spawning saw no pgid; deliver it now.
        if handle.kill_requested.load(Ordering::SeqCst)
            && let Some(pgid) = handle.pgid()
            && let Err(e) = signal_process_group(pgid, Signal::Terminate)
        {
            warn!(build_id = %build_id, error = %e, "failed to deliver pending kill");
        }

        let started = record.clone();
        let watched = WatchedBuild {
            record,
            tracker: ProgressTracker::new(),
            writer,
            last_write: Instant::now(),
        };
        let inner = Arc::clone(&self);
        tokio::spawn(async move { inner.watch_child(child, watched, handle).await });

        Ok(started)
    }

    fn fail_before_spawn(&self, mut record: BuildRecord, handle: &BuildHandle, text: String) {
        let error_type = classify(&text, None);
        record.fail(error_type, text.clone(), text, Utc::now());
        let committed = match self.commit_terminal(record) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(build_id = %handle.build_id, error = %e, "failed to finalize unstarted build");
                None
            }
        };
        self.untrack(&handle.build_id);
        handle.finished.send_replace(committed);
    }

    /// Exit watcher: pump output until the child exits, then finalize.
    async fn watch_child(
        self: Arc<Self>,
        mut child: Child,
        mut watched: WatchedBuild,
        handle: Arc<BuildHandle>,
    ) {
        let (tx, mut rx) = mpsc::channel::<String>(1024);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let heartbeat_every = self.config.heartbeat_interval();
        let mut streams_open = true;
        let status = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some(line) => self.handle_line(&mut watched, line, heartbeat_every).await,
                    None => streams_open = false,
                },
                status = child.wait() => break status,
            }
        };

        // Helpers that inherited the pipes can hold them open; do not wait forever.
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while streams_open {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(line)) => self.handle_line(&mut watched, line, heartbeat_every).await,
                _ => streams_open = false,
            }
        }

        let finished = self.finish_child(watched, status, &handle).await;
        self.untrack(&handle.build_id);
        handle.finished.send_replace(finished);
    }

    async fn handle_line(&self, watched: &mut WatchedBuild, line: String, heartbeat_every: Duration) {
        if let Err(e) = watched.writer.append_line(&line).await {
            warn!(build_id = %watched.record.build_id, error = %e, "failed to append build output");
        }

        match parse_report(&line) {
            Some(report) => match watched.tracker.apply(report) {
                Ok(update) => {
                    debug!(
                        build_id = %watched.record.build_id,
                        step = %update.step,
                        progress = update.progress,
                        "step report"
                    );
                    watched.record.current_step = update.step;
                    watched.record.progress = update.progress;
                    watched.record.message = update
                        .message
                        .unwrap_or_else(|| update.step.description().to_string());
                    watched.record.step_timings = watched.tracker.timings_at(Utc::now());
                    self.persist(watched);
                }
                Err(rejected) => {
                    warn!(build_id = %watched.record.build_id, %rejected, "ignoring step report");
                }
            },
            None if watched.last_write.elapsed() >= heartbeat_every => self.persist(watched),
            None => {}
        }
    }

    fn persist(&self, watched: &mut WatchedBuild) {
        watched.record.updated_at = Utc::now();
        watched.last_write = Instant::now();
        match self.store.write(&watched.record) {
            Ok(()) => {}
            Err(BuildError::InvalidTransition { from, .. }) => {
                debug!(build_id = %watched.record.build_id, %from, "build finalized elsewhere; skipping update");
            }
            Err(e) => {
                warn!(build_id = %watched.record.build_id, error = %e, "failed to write status update");
            }
        }
    }

    async fn finish_child(
        &self,
        watched: WatchedBuild,
        status: std::io::Result<ExitStatus>,
        handle: &BuildHandle,
    ) -> Option<BuildRecord> {
        let WatchedBuild {
            mut record,
            tracker,
            mut writer,
            ..
        } = watched;
        let now = Utc::now();
        record.step_timings = tracker.timings_at(now);

        let exit_status = match status {
            Ok(status) => Some(status),
            Err(e) => {
                error!(build_id = %record.build_id, error = %e, "failed to collect exit status");
                None
            }
        };
        let exit_code = exit_status.and_then(exit_code_of);
        record.exit_code = exit_code;
        let requested_elsewhere = matches!(
            self.store.read(&record.build_id),
            Ok(Some(stored)) if stored.kill_requested
        );
        record.kill_requested = handle.kill_requested.load(Ordering::SeqCst) || requested_elsewhere;

        if record.kill_requested {
            record.message = "Build was cancelled by user".to_string();
            record.finish(BuildStatus::Killed, now);
        } else if exit_status.is_some_and(|s| s.success()) {
            record.current_step = BuildStep::Complete;
            record.progress = 100;
            record.message = "Build completed successfully".to_string();
            record.build_size_bytes = self.measure_artifact(&record.environment).await;
            record.finish(BuildStatus::Success, now);
        } else {
            let tail = LogSink::new(&record.log_path)
                .tail_chars(self.config.supervisor.error_tail_chars)
                .unwrap_or_else(|e| {
                    warn!(build_id = %record.build_id, error = %e, "failed to read log tail");
                    String::new()
                });
            let error_type = classify(&tail, exit_code);
            let (message, error) = summarize_failure(&tail, exit_code);
            record.fail(error_type, message, error, now);
        }

        let footer = format!(
            "{} Build {} finished: {}{}",
            LOG_PREFIX,
            record.build_id,
            record.status,
            exit_code
                .map(|code| format!(" (exit code {})", code))
                .unwrap_or_default()
        );
        if let Err(e) = writer.append_line(&footer).await {
            warn!(build_id = %record.build_id, error = %e, "failed to write log footer");
        }

        match self.commit_terminal(record) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(build_id = %handle.build_id, error = %e, "failed to finalize build");
                None
            }
        }
    }

    /// Total size of the environment's artifact directory, if it exists.
    async fn measure_artifact(&self, environment: &str) -> Option<u64> {
        let env_config = self.config.environments.get(environment)?;
        let artifact_dir = env_config.artifact_dir.as_ref()?;
        let path = self
            .config
            .resolve(&env_config.working_dir)
            .join(artifact_dir);
        tokio::task::spawn_blocking(move || directory_size(&path))
            .await
            .ok()
            .flatten()
    }

    async fn kill(self: Arc<Self>, build_id: &str) -> Result<BuildRecord, BuildError> {
        let record = self.observe(build_id)?;
        if record.is_terminal() {
            debug!(build_id, status = %record.status, "kill on finished build is a no-op");
            return Ok(record);
        }

        let handle = match self.tracked(build_id) {
            Some(handle) => handle,
            // Alive but unwatched: a previous supervisor launched it.
            None => self.adopt(record)?,
        };
        handle.kill_requested.store(true, Ordering::SeqCst);
        let mut finished = handle.finished.subscribe();
        self.mark_kill_requested(build_id);
        info!(build_id, environment = %handle.environment, "kill requested");

        if let Some(pgid) = handle.pgid() {
            signal_process_group(pgid, Signal::Terminate).map_err(|source| BuildError::Signal {
                build_id: build_id.to_string(),
                source,
            })?;
        }

        if let Some(record) = await_finished(&mut finished, self.config.kill_grace()).await {
            return Ok(record);
        }

        warn!(build_id, "build did not exit after SIGTERM; sending SIGKILL");
        if let Some(pgid) = handle.pgid() {
            signal_process_group(pgid, Signal::Kill).map_err(|source| BuildError::Signal {
                build_id: build_id.to_string(),
                source,
            })?;
        }
        match await_finished(&mut finished, KILL_CONFIRM_TIMEOUT).await {
            Some(record) => Ok(record),
            None => {
                warn!(build_id, "build still not finalized after SIGKILL");
                self.observe(build_id)
            }
        }
    }

    /// Persist the kill request so a supervisor in another process that owns
    /// the child finalizes it as killed rather than failed.
    fn mark_kill_requested(&self, build_id: &str) {
        match self.store.request_kill(build_id) {
            Ok(true) => debug!(build_id, "recorded kill request"),
            Ok(false) => {}
            Err(e) => warn!(build_id, error = %e, "failed to record kill request"),
        }
    }

    /// Take over a live build whose supervisor died. Without its pipes the
    /// exit status is unknowable, so the build ends as interrupted (or killed).
    fn adopt(self: &Arc<Self>, record: BuildRecord) -> Result<Arc<BuildHandle>, BuildError> {
        let Some(pid) = record.pid else {
            return Err(BuildError::InvalidConfig(format!(
                "build {} has no process to adopt",
                record.build_id
            )));
        };
        let fresh = Arc::new(BuildHandle::new(
            &record.build_id,
            &record.environment,
            Some(pid),
        ));
        let handle = self.track(Arc::clone(&fresh))?;
        if !Arc::ptr_eq(&handle, &fresh) {
            return Ok(handle);
        }
        info!(build_id = %record.build_id, pid, "adopted running build");

        let inner = Arc::clone(self);
        let watched = Arc::clone(&handle);
        tokio::spawn(async move { inner.watch_adopted(record, pid, watched).await });
        Ok(handle)
    }

    async fn watch_adopted(self: Arc<Self>, record: BuildRecord, pid: u32, handle: Arc<BuildHandle>) {
        while is_process_alive(pid) {
            tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
        }
        let mut record = match self.store.read(&record.build_id) {
            Ok(Some(latest)) => latest,
            _ => record,
        };
        record.kill_requested = record.kill_requested || handle.kill_requested.load(Ordering::SeqCst);
        let finished = if record.is_terminal() {
            Some(record)
        } else {
            match self.finalize_interrupted(record) {
                Ok(record) => Some(record),
                Err(e) => {
                    error!(build_id = %handle.build_id, error = %e, "failed to finalize adopted build");
                    None
                }
            }
        };
        self.untrack(&handle.build_id);
        handle.finished.send_replace(finished);
    }

    fn recover(self: Arc<Self>) -> Result<RecoveryReport, BuildError> {
        let mut report = RecoveryReport::default();

        for record in self.store.list()? {
            if record.is_terminal() || self.is_tracked(&record.build_id) {
                continue;
            }
            let build_id = record.build_id.clone();
            let pid = record.pid;
            match pid {
                Some(pid) if is_process_alive(pid) => {
                    self.adopt(record)?;
                    report.adopted.push(build_id);
                }
                _ => {
                    if self.reconcile_if_orphaned(record)?.is_terminal() {
                        report.interrupted.push(build_id);
                    }
                }
            }
        }

        for (environment, holder) in self.locks.list()? {
            if self.clear_stale_lock(&environment, &holder)? {
                report.stale_locks.push(environment);
            }
        }

        if !report.is_empty() {
            info!(
                interrupted = report.interrupted.len(),
                adopted = report.adopted.len(),
                stale_locks = report.stale_locks.len(),
                "recovered build state"
            );
        }
        Ok(report)
    }
}

async fn await_finished(
    finished: &mut watch::Receiver<Option<BuildRecord>>,
    limit: Duration,
) -> Option<BuildRecord> {
    match tokio::time::timeout(limit, finished.wait_for(Option::is_some)).await {
        Ok(Ok(record)) => (*record).clone(),
        _ => None,
    }
}

/// Forward lines from one child pipe. Invalid UTF-8 is replaced, not fatal.
async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "stopped reading build output");
                break;
            }
        }
    }
}

fn directory_size(path: &Path) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    let total = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    Some(total)
}
