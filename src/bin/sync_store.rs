use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use doccrawl::bulk::{DEFAULT_FLUSH_BYTES, DEFAULT_FLUSH_WORKERS};
use doccrawl::config::{init_tracing, IndexArgs, StoreArgs};
use doccrawl::search::schema::{default_schema, parse_schema};
use doccrawl::store::DEFAULT_STREAM_BATCH;
use doccrawl::{BulkConfig, ElasticIndex, PgStore, ReconcileMode, Reconciler};

#[derive(Parser, Debug)]
#[command(
    name = "doccrawl-sync",
    about = "Rebuild the search index from the canonical Postgres store"
)]
struct SyncCli {
    /// Delete and recreate the search index before resyncing.
    #[arg(long)]
    reset: bool,

    /// JSON index mapping used with --reset (defaults to the built-in mapping).
    #[arg(long, env = "DOCCRAWL_INDEX_SCHEMA", value_name = "FILE")]
    schema: Option<PathBuf>,

    /// Pages fetched from Postgres per cursor round trip.
    #[arg(long, env = "DOCCRAWL_STREAM_BATCH", default_value_t = DEFAULT_STREAM_BATCH)]
    stream_batch: usize,

    /// Concurrent bulk requests.
    #[arg(long, env = "DOCCRAWL_BULK_WORKERS", default_value_t = DEFAULT_FLUSH_WORKERS)]
    workers: usize,

    /// Buffered bytes that trigger a bulk flush.
    #[arg(long, env = "DOCCRAWL_BULK_FLUSH_BYTES", default_value_t = DEFAULT_FLUSH_BYTES)]
    flush_bytes: usize,

    /// Milliseconds between time-based bulk flushes.
    #[arg(long, env = "DOCCRAWL_BULK_FLUSH_MS", default_value_t = 1000)]
    flush_interval_ms: u64,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    index: IndexArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = SyncCli::parse();

    let bulk = BulkConfig {
        flush_bytes: cli.flush_bytes,
        flush_interval: Duration::from_millis(cli.flush_interval_ms),
        workers: cli.workers,
        ..BulkConfig::default()
    };
    bulk.validate().context("invalid bulk settings")?;

    let mode = if cli.reset {
        let schema = match &cli.schema {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read schema {}", path.display()))?;
                parse_schema(&raw)
                    .with_context(|| format!("invalid schema {}", path.display()))?
            }
            None => default_schema(),
        };
        ReconcileMode::Reset { schema }
    } else {
        ReconcileMode::Resync
    };

    tracing::info!("connecting to services");
    let store = Arc::new(
        PgStore::connect(&cli.store.database_url, 1)
            .await
            .context("failed to connect to Postgres")?,
    );
    let index = Arc::new(
        ElasticIndex::new(&cli.index.elasticsearch_url, &cli.index.index)
            .context("invalid search index settings")?,
    );

    let reconciler = Reconciler::new(store.clone(), index)
        .with_bulk_config(bulk)
        .with_stream_batch(cli.stream_batch);
    let report = reconciler
        .run(mode)
        .await
        .context("reconciliation failed")?;

    tracing::info!(
        indexed = report.indexed,
        failed = report.failed,
        elapsed_secs = report.elapsed.as_secs_f64(),
        docs_per_sec = report.rate(),
        "sync complete"
    );

    drop(reconciler);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.close();
    }
    Ok(())
}
