// ABOUTME: CLI entry point - run the replication daemon or a single poll cycle
// ABOUTME: Configuration comes from a TOML file; log filtering from --log or the environment

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use changelog_replicator::config::Config;
use changelog_replicator::daemon::ReplicationDaemon;

#[derive(Parser)]
#[command(
    name = "changelog-replicator",
    version,
    about = "Replicates row changes from append-only change logs to a relational sink"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "replicator.toml", env = "REPLICATOR_CONFIG")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "changelog_replicator=debug"
    #[arg(long, default_value = "info", env = "REPLICATOR_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run continuously, polling at the configured interval
    Run,
    /// Run exactly one poll cycle over all tables and exit
    Cycle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log).context("Invalid log filter expression")?,
        )
        .init();

    let config = Config::load(&cli.config)?;
    let daemon = ReplicationDaemon::new(config);

    match cli.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                    let _ = shutdown_tx.send(());
                }
            });
            daemon.run(shutdown_rx).await
        }
        Command::Cycle => {
            let summary = daemon.run_cycle().await?;
            info!(
                "Cycle complete: {} tables, {} log rows read, {} events, {} applied, {} gaps in {}ms",
                summary.tables,
                summary.rows_read,
                summary.events_delivered,
                summary.rows_applied,
                summary.gaps_skipped,
                summary.duration_ms
            );
            if !summary.is_success() {
                for error in &summary.errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("Cycle finished with {} errors", summary.errors.len());
            }
            Ok(())
        }
    }
}
