use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildmaster::build::{BuildConfig, BuildMode};
use buildmaster::config::{DEFAULT_CONFIG_FILE, ServiceConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "buildmaster")]
#[command(version, about = "Build orchestration and progress monitoring service")]
pub struct Cli {
    /// Path to buildmaster.toml
    #[arg(long, global = true, env = "BUILDMASTER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the REST server (recovers interrupted builds first)
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (CORS permissive for a local dashboard)
        #[arg(long)]
        dev: bool,
    },
    /// Run a build in the foreground and show its progress
    Run {
        /// Environment to build
        environment: String,

        /// Build mode: quick, full, phased, phased-prod, clean, ram-optimized
        #[arg(short, long, default_value = "full")]
        mode: BuildMode,

        #[arg(long)]
        skip_deps: bool,

        #[arg(long)]
        force_clean: bool,

        /// Parallel workers (0 = half the CPUs)
        #[arg(short, long)]
        workers: Option<u32>,
    },
    /// Show the status of a build
    Status {
        build_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Print the last lines of a build's log
    Logs {
        build_id: String,

        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },
    /// List recent builds for an environment, newest first
    History {
        environment: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
    /// Reconcile builds and locks left behind by a crashed supervisor
    Recover {
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: &std::path::Path) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_or_default(path)?;
    config
        .apply_env_overrides()
        .context("Invalid BUILDMASTER_* environment override")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let _log_guard = buildmaster::logging::init_tracing(
        cli.verbose,
        cli.log_json || config.logging.json,
        config.log_file_dir().as_deref(),
    )?;

    match cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, port, host, dev).await?;
        }
        Commands::Run {
            environment,
            mode,
            skip_deps,
            force_clean,
            workers,
        } => {
            let build_config = BuildConfig {
                mode,
                skip_deps,
                force_clean,
                workers,
                ..Default::default()
            };
            cmd::cmd_run(config, &environment, build_config, cli.verbose).await?;
        }
        Commands::Status { build_id, json } => cmd::cmd_status(config, &build_id, json)?,
        Commands::Logs { build_id, lines } => cmd::cmd_logs(config, &build_id, lines)?,
        Commands::History {
            environment,
            limit,
            json,
        } => cmd::cmd_history(config, &environment, limit, json)?,
        Commands::Recover { json } => cmd::cmd_recover(config, json)?,
    }

    Ok(())
}
