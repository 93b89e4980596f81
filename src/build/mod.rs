//! Build orchestration and progress monitoring.
//!
//! ## Overview
//!
//! A build is one run of an externally defined build procedure (a bundler
//! script) for a named environment. The supervisor launches it as a child
//! process group, follows the step reports it prints, persists a
//! crash-safe status record, and files the finished record into history.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Dashboard│ ───────> │  server.rs  (axum Router, graceful shutdown)     │
//! │  / CLI   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │                                        │
//!                       │         │ BuildSupervisor::start / observe / kill │
//!                       │         v                                        │
//!                       │  supervisor.rs  (exit watcher, reconciler)       │
//!                       │    │        │          │            │            │
//!                       │    v        v          v            v            │
//!                       │  lock.rs  status_    log_sink.rs  history.rs     │
//!                       │           store.rs                               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                         |
//! |----------------|--------------------------------------------------------|
//! | `models`       | `BuildRecord`, `BuildStatus`, `BuildStep`, `BuildConfig` |
//! | `report`       | Step-report parsing and `ProgressTracker`              |
//! | `classifier`   | Log tail → `ErrorType`                                 |
//! | `heartbeat`    | Stall detection from `updated_at`                      |
//! | `process`      | Process-group spawn, signal, and liveness helpers      |
//!
//! ## Build Lifecycle
//!
//! 1. `start` acquires the environment lock, writes a `pending` record, and
//!    spawns the procedure with the build configuration in its environment.
//! 2. The exit watcher copies every output line to the log and applies step
//!    reports to the record (`running`, step, progress).
//! 3. On exit the watcher classifies failures from the log tail, writes the
//!    terminal record, releases the lock, and appends to history.
//! 4. A record left `running` by a dead supervisor is finalized as
//!    `error` / `INTERRUPTED` the next time anyone reads it.

pub mod api;
pub mod classifier;
pub mod heartbeat;
pub mod history;
pub mod lock;
pub mod log_sink;
pub mod models;
pub mod process;
pub mod report;
pub mod server;
pub mod status_store;
pub mod supervisor;

pub use models::{BuildConfig, BuildMode, BuildRecord, BuildStatus, BuildStep, ErrorType};
pub use supervisor::{BuildSupervisor, BuildView, RecoveryReport};
