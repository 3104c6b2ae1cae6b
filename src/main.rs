//! Pynchy CLI entry point (§6 External interfaces).
//!
//! Runs in the foreground only: no daemonize, no PID file, no subcommands.
//! Configuration path and debug logging are the only flags; everything else
//! lives in the config document itself.

use anyhow::Context as _;
use clap::Parser;
use pynchy::config::Config;
use pynchy::daemon::{self, LogPaths};
use pynchy::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "pynchy", version)]
#[command(about = "Multi-channel chat-driven AI agent orchestrator")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from_path(&cli.config).context("failed to load configuration")?;
    let log_paths = LogPaths::new(&config.instance_dir);
    let otlp_provider = daemon::init_tracing(&log_paths, cli.debug, &config.logging);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(run(cli.config));

    if let Some(provider) = otlp_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "failed to flush OTLP trace batcher on exit");
        }
    }

    result
}

async fn run(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::bootstrap(config_path).await.context("startup failed")?;
    daemon::shutdown_with_watchdog(async {
        if let Err(e) = orchestrator.run(daemon::wait_for_shutdown_signal()).await {
            tracing::error!(error = %e, "orchestrator exited with error");
        }
    })
    .await;
    Ok(())
}
