// ============================================================================
// roadwatch-db - CLI database inspection tool for roadwatch
// ============================================================================
// Usage:
//   roadwatch-db stats                       Show database statistics
//   roadwatch-db list-pending [--limit N]    List records awaiting upload
//   roadwatch-db export [--output FILE]      Export all records as a JSON tree
//   roadwatch-db clear --yes                 Delete all records and the queue
//   roadwatch-db drain --outbox DIR          Upload pending records into DIR
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use roadwatch_core::{
    AuthStatus, DurableStore, EngineConfig, ObjectUploader, PendingWriteQueue, RecordLog,
    SyncCoordinator, UploadError,
};

/// Roadwatch database inspection tool
#[derive(Parser)]
#[command(name = "roadwatch-db", version, about = "Inspect and manage the roadwatch database")]
struct Cli {
    /// Path to the database file (default: ~/.roadwatch/roadwatch.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database statistics (cache size, records, pending uploads)
    Stats,

    /// List records that have not been uploaded yet, oldest first
    ListPending {
        /// Show at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Export every record as a JSON tree keyed by path segment
    Export {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete all records, the pending queue and the record count
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Upload pending records into a local directory, mirroring their paths
    Drain {
        /// Root directory that receives the files
        #[arg(long)]
        outbox: PathBuf,
    },
}

/// Uploader that "uploads" into a directory tree on disk
struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, path: &str, filename: &str) -> Result<PathBuf, UploadError> {
        let relative = Path::new(path.trim_matches('/')).join(filename);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if escapes {
            return Err(UploadError::Failed(format!(
                "refusing to write outside the outbox: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectUploader for DirectoryUploader {
    async fn upload(&self, filename: &str, content: &str, path: &str) -> Result<String, UploadError> {
        let target = self.target(path, filename)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::Failed(e.to_string()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| UploadError::Failed(e.to_string()))?;
        Ok(target.display().to_string())
    }
}

async fn open_records(store: &DurableStore, prefix: &str) -> Result<Arc<RecordLog>> {
    let queue = Arc::new(PendingWriteQueue::open(store.clone()).await?);
    Ok(Arc::new(RecordLog::open(store.clone(), queue, prefix).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("roadwatch_core=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let db_path = cli.db_path.unwrap_or(config.db_path);

    let store = DurableStore::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let records = open_records(&store, &config.record_prefix).await?;

    match cli.command {
        Commands::Stats => cmd_stats(&store, &records).await,
        Commands::ListPending { limit } => cmd_list_pending(&records, limit).await,
        Commands::Export { output } => cmd_export(&store, &records, output).await,
        Commands::Clear { yes } => cmd_clear(&records, yes).await,
        Commands::Drain { outbox } => cmd_drain(records, outbox).await,
    }
}

async fn cmd_stats(store: &DurableStore, records: &RecordLog) -> Result<()> {
    let stats = store.stats().await?;

    println!("=== Roadwatch Database Stats ===");
    println!("Database: {}", store.path().display());
    println!();
    for (table, count) in &stats.entries {
        println!("  {:18} {}", table, count);
    }
    println!();
    println!("Records captured: {}", records.log_count().await?);
    println!("Pending upload:   {}", records.queue().len().await);

    Ok(())
}

async fn cmd_list_pending(records: &RecordLog, limit: Option<usize>) -> Result<()> {
    let pending = records.queue().list().await;
    if pending.is_empty() {
        println!("No pending records.");
        return Ok(());
    }

    println!("{:<26}  {:<30}  {}", "CAPTURED AT", "ROAD", "RECORD ID");
    println!("{}", "-".repeat(100));

    let shown = limit.unwrap_or(pending.len());
    for record_id in pending.iter().take(shown) {
        match records.get(record_id).await? {
            Some(record) => println!(
                "{:<26}  {:<30}  {}",
                record.timestamp,
                record.payload.road.road_name.chars().take(30).collect::<String>(),
                record_id
            ),
            None => println!("{:<26}  {:<30}  {}", "(missing)", "-", record_id),
        }
    }

    println!("\nTotal: {} pending", pending.len());
    Ok(())
}

async fn cmd_export(store: &DurableStore, records: &RecordLog, output: Option<PathBuf>) -> Result<()> {
    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": store.stats().await?,
        "records": records.export_all().await?,
    });
    let rendered = serde_json::to_string_pretty(&export)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

async fn cmd_clear(records: &RecordLog, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete all records without --yes");
    }
    let removed = records.clear_all().await?;
    println!("Deleted {} records", removed);
    Ok(())
}

async fn cmd_drain(records: Arc<RecordLog>, outbox: PathBuf) -> Result<()> {
    let pending = records.queue().len().await;
    if pending == 0 {
        println!("Nothing to upload.");
        return Ok(());
    }

    info!("Draining {} records into {}", pending, outbox.display());
    let sync = SyncCoordinator::new(
        records,
        Arc::new(DirectoryUploader::new(&outbox)),
        AuthStatus::new(true),
    );
    let report = sync.drain().await?;

    println!("Uploaded {} records to {}", report.synced, outbox.display());
    if report.removed > report.synced {
        println!("Dropped {} stale queue entries", report.removed - report.synced);
    }
    if report.failed > 0 {
        anyhow::bail!("{} records failed to upload and stay pending", report.failed);
    }
    Ok(())
}
