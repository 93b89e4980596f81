//! REST server and crash recovery: `buildmaster serve` and `buildmaster recover`.

use anyhow::{Context, Result};

use buildmaster::build::BuildSupervisor;
use buildmaster::config::ServiceConfig;

pub async fn cmd_serve(
    mut config: ServiceConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if dev {
        config.server.dev_mode = true;
    }
    buildmaster::build::server::start_server(config).await
}

pub fn cmd_recover(config: ServiceConfig, json: bool) -> Result<()> {
    let supervisor = BuildSupervisor::new(config).context("Failed to open build state directory")?;
    let report = supervisor.recover().context("Recovery failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }
    for build_id in &report.interrupted {
        println!("interrupted  {}", build_id);
    }
    for build_id in &report.adopted {
        println!("still alive  {}", build_id);
    }
    for environment in &report.stale_locks {
        println!("stale lock   {}", environment);
    }
    if !report.adopted.is_empty() {
        // Adopted builds are only watched while this process lives.
        println!();
        println!(
            "{} build(s) are still running; start `buildmaster serve` to keep watching them.",
            report.adopted.len()
        );
    }
    Ok(())
}
