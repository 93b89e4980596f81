//! Foreground build: `buildmaster run <env>`.

use std::time::Duration;

use anyhow::{Context, Result};

use buildmaster::build::{BuildConfig, BuildStatus, BuildSupervisor};
use buildmaster::config::ServiceConfig;
use buildmaster::ui::BuildProgressUI;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub async fn cmd_run(
    config: ServiceConfig,
    environment: &str,
    build_config: BuildConfig,
    verbose: bool,
) -> Result<()> {
    let supervisor =
        BuildSupervisor::new(config).context("Failed to open build state directory")?;
    let started = supervisor
        .start(environment, build_config)
        .await
        .with_context(|| format!("Failed to start build for '{}'", environment))?;
    let build_id = started.build_id.clone();

    let mut ui = BuildProgressUI::new(&build_id, environment, verbose);
    ui.update(&started);

    let mut log_offset = 0u64;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let finished = supervisor.wait(&build_id);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(finished, ctrl_c);

    let record = loop {
        tokio::select! {
            record = &mut finished => break record?,
            _ = &mut ctrl_c => {
                eprintln!("\nInterrupted, killing build {}...", build_id);
                break supervisor.kill(&build_id).await?;
            }
            _ = ticker.tick() => {
                let record = supervisor.observe(&build_id)?;
                ui.update(&record);
                let chunk = supervisor.read_log_since(&build_id, log_offset)?;
                log_offset = chunk.offset;
                let lines: Vec<String> = chunk.content.lines().map(str::to_string).collect();
                ui.show_log_lines(&lines);
                let view = supervisor.view(record);
                if view.stalled {
                    ui.show_stalled(view.idle_secs);
                }
            }
        }
    };

    let chunk = supervisor.read_log_since(&build_id, log_offset)?;
    let lines: Vec<String> = chunk.content.lines().map(str::to_string).collect();
    ui.show_log_lines(&lines);
    ui.update(&record);
    ui.finish(&record);

    println!("Build {} finished: {}", record.build_id, record.status);
    match record.status {
        BuildStatus::Success => Ok(()),
        BuildStatus::Killed => anyhow::bail!("Build {} was killed", record.build_id),
        _ => anyhow::bail!(
            "Build {} failed [{}]: {}",
            record.build_id,
            record
                .error_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "BUILD_ERROR".to_string()),
            record.message
        ),
    }
}
