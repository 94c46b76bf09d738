//! Rebuilds the search index from the canonical store.

use crate::bulk::{BulkConfig, BulkError, BulkIndexer};
use crate::config::ConfigError;
use crate::page::IndexDocument;
use crate::search::{IndexError, SearchIndex};
use crate::store::{CanonicalStore, StoreError, DEFAULT_STREAM_BATCH};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROGRESS_EVERY: u64 = 1000;

/// Fatal reconciliation failures. Per-document failures are only counted.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The bulk settings are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The canonical store could not be streamed.
    #[error("canonical store stream failed: {0}")]
    Store(#[from] StoreError),
    /// The index could not be reset.
    #[error("index reset failed: {0}")]
    Index(#[from] IndexError),
    /// The bulk pipeline could not be drained.
    #[error("bulk pipeline failed: {0}")]
    Bulk(#[from] BulkError),
}

/// How the index is prepared before resyncing.
#[derive(Debug, Clone)]
pub enum ReconcileMode {
    /// Upsert every canonical page into the existing index.
    Resync,
    /// Delete and recreate the index from `schema`, then resync.
    Reset {
        /// Index mapping to create.
        schema: Value,
    },
}

/// Summary produced after the bulk pipeline has drained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileReport {
    /// Pages read from the canonical store.
    pub attempted: u64,
    /// Documents accepted by the index.
    pub indexed: u64,
    /// Documents the index rejected.
    pub failed: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl ReconcileReport {
    /// Indexed documents per second.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.indexed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Streams canonical pages into the bulk pipeline.
pub struct Reconciler {
    store: Arc<dyn CanonicalStore>,
    index: Arc<dyn SearchIndex>,
    bulk: BulkConfig,
    stream_batch: usize,
}

impl Reconciler {
    /// Builds a reconciler with default bulk settings.
    pub fn new(store: Arc<dyn CanonicalStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            store,
            index,
            bulk: BulkConfig::default(),
            stream_batch: DEFAULT_STREAM_BATCH,
        }
    }

    /// Overrides the bulk pipeline tuning.
    pub fn with_bulk_config(mut self, bulk: BulkConfig) -> Self {
        self.bulk = bulk;
        self
    }

    /// Overrides how many pages are fetched per cursor round trip.
    pub fn with_stream_batch(mut self, batch: usize) -> Self {
        self.stream_batch = batch.max(1);
        self
    }

    /// Runs one reconciliation pass.
    pub async fn run(&self, mode: ReconcileMode) -> Result<ReconcileReport, ReconcileError> {
        self.bulk.validate()?;
        let started = Instant::now();
        if let ReconcileMode::Reset { schema } = &mode {
            tracing::info!("resetting search index before resync");
            self.index.recreate_index(schema).await?;
        }

        let mut pages = self.store.stream_pages(self.stream_batch).await?;
        let indexer = BulkIndexer::start(Arc::clone(&self.index), self.bulk.clone())?;
        let mut attempted = 0u64;

        while let Some(next) = pages.next().await {
            let page = match next {
                Ok(page) => page,
                Err(err) => {
                    if let Err(close_err) = indexer.close().await {
                        tracing::warn!(
                            error = %close_err,
                            "bulk pipeline failed to close after stream error"
                        );
                    }
                    return Err(err.into());
                }
            };
            indexer.add(IndexDocument::from_page(&page)).await?;
            attempted += 1;
            if attempted % PROGRESS_EVERY == 0 {
                let stats = indexer.stats();
                tracing::info!(
                    attempted,
                    indexed = stats.indexed,
                    failed = stats.failed,
                    "reconciliation progress"
                );
            }
        }

        let stats = indexer.close().await?;
        let report = ReconcileReport {
            attempted,
            indexed: stats.indexed,
            failed: stats.failed,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            attempted = report.attempted,
            indexed = report.indexed,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            docs_per_sec = report.rate(),
            "reconciliation finished"
        );
        Ok(report)
    }
}
