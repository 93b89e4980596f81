//! Read-only views: `buildmaster status`, `logs`, and `history`.

use anyhow::{Context, Result};
use console::style;

use buildmaster::build::{BuildRecord, BuildStatus, BuildSupervisor};
use buildmaster::config::ServiceConfig;

fn open(config: ServiceConfig) -> Result<BuildSupervisor> {
    BuildSupervisor::new(config).context("Failed to open build state directory")
}

fn styled_status(status: BuildStatus) -> String {
    match status {
        BuildStatus::Success => style(status).green().to_string(),
        BuildStatus::Error => style(status).red().to_string(),
        BuildStatus::Killed => style(status).yellow().to_string(),
        BuildStatus::Pending | BuildStatus::Running => style(status).cyan().to_string(),
    }
}

pub fn cmd_status(config: ServiceConfig, build_id: &str, json: bool) -> Result<()> {
    let supervisor = open(config)?;
    let record = supervisor.observe(build_id)?;
    let view = supervisor.view(record);

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let record = &view.record;
    println!();
    println!("Build:        {}", style(&record.build_id).bold());
    println!("Environment:  {}", record.environment);
    println!("Status:       {}", styled_status(record.status));
    println!(
        "Step:         {} ({}%)",
        record.current_step, record.progress
    );
    println!("Message:      {}", record.message);
    println!("Mode:         {}", record.config_snapshot.mode);
    println!("Workers:      {}", record.worker_count);
    println!("Started:      {}", record.started_at.to_rfc3339());
    if let Some(completed) = record.completed_at {
        println!("Completed:    {}", completed.to_rfc3339());
    }
    if let Some(secs) = record.duration_seconds {
        println!("Duration:     {:.2}s", secs);
    }
    if let Some(error_type) = record.error_type {
        println!("Error type:   {}", style(error_type).red());
    }
    if let Some(bytes) = record.build_size_bytes {
        println!("Output size:  {} bytes", bytes);
    }
    if !record.step_timings.is_empty() {
        println!("Step timings:");
        for (step, secs) in &record.step_timings {
            println!("  {:<10} {:>8.2}s", step.as_str(), secs);
        }
    }
    if view.stalled {
        println!(
            "{}",
            style(format!(
                "No progress for {}s (threshold {}s): build may be stalled",
                view.idle_secs, view.stall_threshold_secs
            ))
            .yellow()
        );
    }
    println!("Log:          {}", record.log_path.display());
    if let Some(error) = &record.error {
        println!();
        println!("{}", style("Error output:").red().bold());
        println!("{}", error);
    }
    println!();
    Ok(())
}

pub fn cmd_logs(config: ServiceConfig, build_id: &str, lines: usize) -> Result<()> {
    let supervisor = open(config)?;
    for line in supervisor.tail_log(build_id, lines)? {
        println!("{}", line);
    }
    Ok(())
}

fn history_row(record: &BuildRecord) -> String {
    format!(
        "{:<36}  {:<9} {:<10} {:>8}  {:<16}  {}",
        record.build_id,
        record.status,
        record
            .error_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record
            .duration_seconds
            .map(|secs| format!("{:.1}s", secs))
            .unwrap_or_else(|| "-".to_string()),
        record
            .slowest_step()
            .map(|(step, secs)| format!("{} {:.1}s", step, secs))
            .unwrap_or_else(|| "-".to_string()),
        record.started_at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn cmd_history(config: ServiceConfig, environment: &str, limit: usize, json: bool) -> Result<()> {
    let supervisor = open(config)?;
    supervisor.config().environment(environment)?;
    let records = supervisor.history(environment, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No builds recorded for '{}'.", environment);
        return Ok(());
    }
    println!(
        "{:<36}  {:<9} {:<10} {:>8}  {:<16}  Started",
        "Build", "Status", "Error", "Duration", "Slowest step"
    );
    for record in &records {
        println!("{}", history_row(record));
    }
    Ok(())
}
