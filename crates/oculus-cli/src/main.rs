use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use oculus_core::LakeTable;
use oculus_storage::Store;
use oculus_sync::{SyncConfig, SyncPipeline};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oculus")]
#[command(about = "Used-car listing ingestion and warehouse reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull recent listings from every enabled marketplace into the lake.
    Ingest {
        #[arg(long, default_value_t = 24)]
        window_hours: u32,
    },
    /// Merge changed lake rows into the warehouse, all tables concurrently.
    Reconcile,
    /// Create or upgrade the database schema and exit.
    Migrate,
    /// Write the price-model training snapshot (Parquet + manifest).
    ExportFeatures { dir: PathBuf },
    /// Restamp dead-lettered rows of a lake table so the next reconcile retries them.
    RequeueDeadLetters { table: LakeTable },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = Store::open(&config.store_config())
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            store.close().await;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Ingest { window_hours } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.ingest(window_hours).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            pipeline.store().close().await;
            let failed: Vec<_> = summary.failed().map(|m| m.marketplace.as_str()).collect();
            if !failed.is_empty() {
                bail!("ingestion failed for: {}", failed.join(", "));
            }
        }
        Commands::Reconcile => {
            let pipeline = SyncPipeline::connect(config).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("ctrl-c received, stopping after the current batch");
                    let _ = shutdown_tx.send(true);
                }
            });
            let results = pipeline.reconcile_all(shutdown_rx).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            pipeline.store().close().await;
            if results.iter().any(|r| r.interrupted) {
                bail!("reconcile interrupted; committed batches are kept");
            }
        }
        Commands::ExportFeatures { dir } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let manifest = pipeline.export_features(dir).await?;
            pipeline.store().close().await;
            info!(manifest = %manifest.display(), "export complete");
            println!("{}", manifest.display());
        }
        Commands::RequeueDeadLetters { table } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let requeued = pipeline.requeue_dead_letters(table).await?;
            pipeline.store().close().await;
            println!("requeued {requeued} rows of {table}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help_text() {
        Cli::command().debug_assert();
        for sub in Cli::command().get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
    }
}
