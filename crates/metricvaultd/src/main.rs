//! metricvaultd — the metricvault daemon.
//!
//! Wires the storage engine from a TOML config plus flag overrides:
//! - Backend selection (memory / file snapshot / postgres)
//! - Schema initialization for relational backends
//! - Snapshot restore and the periodic backup loop for file backends
//!
//! # Usage
//!
//! ```text
//! metricvaultd --config metricvault.toml serve
//! metricvaultd --file-storage-path /tmp/metrics-db.json apply batch.json
//! metricvaultd --database-url postgres://localhost/metrics get --kind counter --id PollCount
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use metricvault_core::{MetricKind, MetricRecord, VaultConfig};
use metricvault_store::{MetricPersister, SnapshotCapable, Storage};

#[derive(Parser)]
#[command(name = "metricvaultd", about = "metricvault storage daemon")]
struct Cli {
    /// Path to a metricvault.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Postgres connection string; selects the relational backend.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Snapshot file for the file backend (empty string disables it).
    #[arg(long, global = true)]
    file_storage_path: Option<String>,

    /// Seconds between snapshots; 0 writes after every batch.
    #[arg(long, global = true)]
    store_interval: Option<u64>,

    /// Restore the snapshot file at startup.
    #[arg(long, global = true)]
    restore: Option<bool>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wire storage and run background tasks until Ctrl-C.
    Serve,

    /// Apply a JSON array of metric records from a file ("-" for stdin).
    Apply {
        input: PathBuf,
    },

    /// Print one metric.
    Get {
        #[arg(long)]
        kind: MetricKind,
        #[arg(long)]
        id: String,
    },

    /// Print every non-zero metric as "id: value".
    List,

    /// Check that the backend is reachable.
    Ping,
}

impl Cli {
    /// Config file values with flag overrides applied.
    fn load_config(&self) -> anyhow::Result<VaultConfig> {
        let mut config = match &self.config {
            Some(path) => VaultConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => VaultConfig::default(),
        };
        if let Some(url) = &self.database_url {
            config.storage.database_url = url.clone();
        }
        if let Some(path) = &self.file_storage_path {
            config.storage.file_storage_path = path.clone();
        }
        if let Some(secs) = self.store_interval {
            config.storage.store_interval_secs = secs;
        }
        if let Some(restore) = self.restore {
            config.storage.restore = restore;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialize tracing.
    let default_filter = config
        .log
        .filter
        .clone()
        .unwrap_or_else(|| "info,metricvault=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&default_filter))?,
        )
        .with_writer(std::io::stderr)
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let storage = Storage::open(&config.storage, shutdown_rx).await?;
    let persister = storage.persister();

    match cli.command {
        Command::Serve => {
            info!(backend = persister.name(), "metricvault daemon running");
            tokio::signal::ctrl_c()
                .await
                .context("installing Ctrl-C handler")?;
            info!("shutdown signal received");
        }
        Command::Apply { input } => {
            let batch = read_batch(&input)?;
            let outcome = persister.write_batch(&batch).await?;
            info!(
                updated = outcome.updated.len(),
                inserted = outcome.inserted.len(),
                "batch applied"
            );
            // A one-shot process exits before the next backup tick.
            if let Some(snapshot) = persister.as_snapshot() {
                snapshot.backup_scheduler().save().await?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome.records)?);
        }
        Command::Get { kind, id } => {
            let record = persister.get_required(kind, &id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::List => {
            for line in persister.list().await? {
                println!("{line}");
            }
        }
        Command::Ping => {
            persister.ping().await?;
            println!("ok");
        }
    }

    let _ = shutdown_tx.send(true);
    storage.join().await;
    Ok(())
}

fn read_batch(input: &Path) -> anyhow::Result<Vec<MetricRecord>> {
    let raw = if input.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("reading batch {}", input.display()))?
    };
    serde_json::from_str(&raw).context("parsing batch: expected a JSON array of metric records")
}
