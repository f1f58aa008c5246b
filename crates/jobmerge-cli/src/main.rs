use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use jobmerge_core::RecordMigrationDetail;
use jobmerge_engine::{EngineConfig, MigrationEngine};
use jobmerge_storage::{DedupCache, DocumentStore, InMemoryCache, InMemoryStore, PgStore, RedisCache};

#[derive(Debug, Parser)]
#[command(name = "jobmerge")]
#[command(about = "Job posting migration & deduplication engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate a crawler payload file into the job store.
    Migrate {
        /// Path to the JSON payload.
        payload: PathBuf,
        /// Records per batch (overrides JOBMERGE_BATCH_SIZE).
        #[arg(long)]
        batch_size: Option<usize>,
        /// JSON file mapping company names to known company ids.
        #[arg(long)]
        company_hints: Option<PathBuf>,
    },
    /// Re-run previously failed records from a saved audit trail.
    Reprocess {
        /// JSON file with the record details of a previous run.
        details: PathBuf,
        #[arg(long)]
        company_hints: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let engine = build_engine().await?;

    match cli.command {
        Commands::Migrate {
            payload,
            batch_size,
            company_hints,
        } => {
            let body = std::fs::read_to_string(&payload)
                .with_context(|| format!("reading payload {}", payload.display()))?;
            let hints = load_hints(company_hints.as_deref())?;
            let report = engine
                .migrate_from_json_in_batches(&body, &hints, batch_size)
                .await?;
            println!("{}", report.summary);
            for line in &report.details {
                println!("duplicate: {line}");
            }
            for detail in &report.record_details {
                println!(
                    "{} | {} @ {} | {}",
                    detail.status, detail.title, detail.company, detail.message
                );
            }
        }
        Commands::Reprocess {
            details,
            company_hints,
        } => {
            let body = std::fs::read_to_string(&details)
                .with_context(|| format!("reading details {}", details.display()))?;
            let failed: Vec<RecordMigrationDetail> =
                serde_json::from_str(&body).context("parsing record details")?;
            let hints = load_hints(company_hints.as_deref())?;
            let report = engine.reprocess_failed_records(&failed, &hints).await?;
            println!("{}", report.message);
            for detail in &report.details {
                println!(
                    "{} | {} @ {} | {}",
                    detail.status, detail.title, detail.company, detail.message
                );
            }
        }
    }

    Ok(())
}

/// Wire the engine from the environment. Both backends degrade to their
/// in-process stand-ins when unconfigured, so a local dry run needs no
/// services at all.
async fn build_engine() -> Result<MigrationEngine> {
    let redis_enabled = std::env::var("REDIS_ENABLED")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    let cache: Arc<dyn DedupCache> = match std::env::var("REDIS_URL") {
        Ok(url) if redis_enabled => Arc::new(RedisCache::connect(&url).await),
        _ => {
            warn!("REDIS_URL unset or redis disabled, using in-memory dedup cache");
            Arc::new(InMemoryCache::new())
        }
    };

    let store: Arc<dyn DocumentStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PgStore::connect(&url).await.context("connecting to database")?;
            store.ensure_schema().await.context("applying schema")?;
            Arc::new(store)
        }
        Err(_) => {
            warn!("DATABASE_URL unset, using in-memory store (writes are not persisted)");
            Arc::new(InMemoryStore::new())
        }
    };

    Ok(MigrationEngine::new(cache, store, EngineConfig::from_env()))
}

fn load_hints(path: Option<&std::path::Path>) -> Result<HashMap<String, String>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading company hints {}", path.display()))?;
    serde_json::from_str(&body).context("parsing company hints")
}
