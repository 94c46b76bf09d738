//! Batched, bounded-concurrency bulk writer for the search index.

use crate::config::ConfigError;
use crate::page::IndexDocument;
use crate::search::SearchIndex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Flush once buffered documents reach this many bytes.
pub const DEFAULT_FLUSH_BYTES: usize = 5 * 1024 * 1024;
/// Flush whatever is buffered at this interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Concurrent bulk requests in flight.
pub const DEFAULT_FLUSH_WORKERS: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Tuning for [`BulkIndexer`].
#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Byte threshold that triggers a flush.
    pub flush_bytes: usize,
    /// Time-based flush interval.
    pub flush_interval: Duration,
    /// Maximum concurrent flush workers.
    pub workers: usize,
    /// Documents buffered in the intake channel before `add` waits.
    pub queue_capacity: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            flush_bytes: DEFAULT_FLUSH_BYTES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            workers: DEFAULT_FLUSH_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BulkConfig {
    /// Rejects configurations that could never flush.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("bulk workers must be > 0".into()));
        }
        if self.flush_bytes == 0 {
            return Err(ConfigError::Invalid("bulk flush bytes must be > 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "bulk flush interval must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Failures of the pipeline itself, as opposed to per-document failures.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    /// The collector stopped accepting documents.
    #[error("bulk pipeline is closed")]
    Closed,
    /// A collector or flush task panicked or was cancelled.
    #[error("bulk worker failed: {0}")]
    Worker(#[from] JoinError),
}

/// Final counters once the pipeline has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Documents the index accepted.
    pub indexed: u64,
    /// Documents the index rejected, including whole failed requests.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    indexed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record_indexed(&self) {
        self.indexed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkStats {
        BulkStats {
            indexed: self.indexed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

/// Buffers documents and writes them to the index in bulk requests.
pub struct BulkIndexer {
    tx: mpsc::Sender<IndexDocument>,
    collector: JoinHandle<Result<(), BulkError>>,
    counters: Arc<Counters>,
}

impl BulkIndexer {
    /// Validates `config`, then spawns the collector task.
    pub fn start(index: Arc<dyn SearchIndex>, config: BulkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let collector = tokio::spawn(collect(rx, index, config, Arc::clone(&counters)));
        Ok(Self {
            tx,
            collector,
            counters,
        })
    }

    /// Queues a document, waiting when the intake channel is full.
    pub async fn add(&self, document: IndexDocument) -> Result<(), BulkError> {
        self.tx.send(document).await.map_err(|_| BulkError::Closed)
    }

    /// Counters so far; final only after [`BulkIndexer::close`].
    pub fn stats(&self) -> BulkStats {
        self.counters.snapshot()
    }

    /// Flushes everything still buffered and waits for every worker.
    pub async fn close(self) -> Result<BulkStats, BulkError> {
        drop(self.tx);
        self.collector.await??;
        Ok(self.counters.snapshot())
    }
}

async fn collect(
    mut rx: mpsc::Receiver<IndexDocument>,
    index: Arc<dyn SearchIndex>,
    config: BulkConfig,
    counters: Arc<Counters>,
) -> Result<(), BulkError> {
    let mut flusher = Flusher {
        index,
        counters,
        permits: Arc::new(Semaphore::new(config.workers.max(1))),
        workers: JoinSet::new(),
    };
    let mut buffer = Vec::new();
    let mut buffered_bytes = 0usize;

    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(document) => {
                    buffered_bytes += document.estimated_bytes();
                    buffer.push(document);
                    if buffered_bytes >= config.flush_bytes {
                        buffered_bytes = 0;
                        flusher.flush(std::mem::take(&mut buffer)).await?;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    buffered_bytes = 0;
                    flusher.flush(std::mem::take(&mut buffer)).await?;
                }
            }
            Some(joined) = flusher.workers.join_next(), if !flusher.workers.is_empty() => joined?,
        }
    }

    if !buffer.is_empty() {
        flusher.flush(buffer).await?;
    }
    while let Some(joined) = flusher.workers.join_next().await {
        joined?;
    }
    Ok(())
}

struct Flusher {
    index: Arc<dyn SearchIndex>,
    counters: Arc<Counters>,
    permits: Arc<Semaphore>,
    workers: JoinSet<()>,
}

impl Flusher {
    // Waits for a worker slot, then hands the batch to a new worker.
    async fn flush(&mut self, batch: Vec<IndexDocument>) -> Result<(), BulkError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BulkError::Closed)?;
        let index = Arc::clone(&self.index);
        let counters = Arc::clone(&self.counters);
        self.workers.spawn(async move {
            write_batch(index.as_ref(), &batch, &counters).await;
            drop(permit);
        });
        Ok(())
    }
}

async fn write_batch(index: &dyn SearchIndex, batch: &[IndexDocument], counters: &Counters) {
    tracing::debug!(documents = batch.len(), "flushing bulk batch");
    match index.bulk_index(batch).await {
        Ok(results) => {
            for result in &results {
                match &result.error {
                    None => counters.record_indexed(),
                    Some(reason) => {
                        counters.record_failed(1);
                        tracing::warn!(id = %result.id, reason = %reason, "bulk index item failed");
                    }
                }
            }
            for document in batch.iter().skip(results.len()) {
                counters.record_failed(1);
                tracing::warn!(id = %document.url, reason = "no result reported", "bulk index item failed");
            }
        }
        Err(err) => {
            counters.record_failed(batch.len() as u64);
            for document in batch {
                tracing::warn!(id = %document.url, reason = %err, "bulk index item failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{BulkItemResult, IndexError, IndexHit};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    fn doc(url: &str) -> IndexDocument {
        IndexDocument {
            url: url.into(),
            title: "t".into(),
            content: "c".into(),
            code_snippets: String::new(),
            crawled_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct RecordingIndex {
        batches: Mutex<Vec<Vec<String>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        reject: Vec<String>,
        fail_requests: bool,
    }

    #[async_trait]
    impl SearchIndex for RecordingIndex {
        async fn ensure_index(&self, _schema: &Value) -> Result<(), IndexError> {
            Ok(())
        }

        async fn recreate_index(&self, _schema: &Value) -> Result<(), IndexError> {
            Ok(())
        }

        async fn index_document(&self, _document: &IndexDocument) -> Result<(), IndexError> {
            Ok(())
        }

        async fn bulk_index(
            &self,
            documents: &[IndexDocument],
        ) -> Result<Vec<BulkItemResult>, IndexError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.batches
                .lock()
                .await
                .push(documents.iter().map(|d| d.url.clone()).collect());
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_requests {
                return Err(IndexError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(documents
                .iter()
                .map(|d| {
                    if self.reject.contains(&d.url) {
                        BulkItemResult::failed(&d.url, "rejected")
                    } else {
                        BulkItemResult::ok(&d.url)
                    }
                })
                .collect())
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<IndexHit>, IndexError> {
            Ok(Vec::new())
        }
    }

    fn config(flush_bytes: usize, workers: usize) -> BulkConfig {
        BulkConfig {
            flush_bytes,
            flush_interval: Duration::from_secs(60),
            workers,
            queue_capacity: 8,
        }
    }

    #[tokio::test]
    async fn counts_item_successes_and_failures() {
        let index = Arc::new(RecordingIndex {
            reject: vec!["u1".into(), "u3".into()],
            ..RecordingIndex::default()
        });
        let indexer = BulkIndexer::start(index.clone(), config(DEFAULT_FLUSH_BYTES, 2)).unwrap();
        for i in 0..5 {
            indexer.add(doc(&format!("u{i}"))).await.unwrap();
        }
        let stats = indexer.close().await.unwrap();
        assert_eq!(stats, BulkStats { indexed: 3, failed: 2 });
        // Nothing reached the byte threshold, so everything went out on close.
        assert_eq!(index.batches.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn byte_threshold_splits_batches() {
        let index = Arc::new(RecordingIndex::default());
        let per_doc = doc("u0").estimated_bytes();
        let indexer = BulkIndexer::start(index.clone(), config(per_doc * 2, 1)).unwrap();
        for i in 0..5 {
            indexer.add(doc(&format!("u{i}"))).await.unwrap();
        }
        let stats = indexer.close().await.unwrap();
        assert_eq!(stats.indexed, 5);

        let mut sizes: Vec<usize> = index.batches.lock().await.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_partial_batches() {
        let index = Arc::new(RecordingIndex::default());
        let indexer = BulkIndexer::start(
            index.clone(),
            BulkConfig {
                flush_interval: Duration::from_millis(100),
                ..config(DEFAULT_FLUSH_BYTES, 1)
            },
        )
        .unwrap();
        indexer.add(doc("u0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(index.batches.lock().await.len(), 1);
        assert_eq!(indexer.stats().indexed, 1);
        indexer.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_requests_fail_every_item() {
        let index = Arc::new(RecordingIndex {
            fail_requests: true,
            ..RecordingIndex::default()
        });
        let per_doc = doc("u0").estimated_bytes();
        let indexer = BulkIndexer::start(index, config(per_doc * 2, 2)).unwrap();
        for i in 0..3 {
            indexer.add(doc(&format!("u{i}"))).await.unwrap();
        }
        let stats = indexer.close().await.unwrap();
        assert_eq!(stats, BulkStats { indexed: 0, failed: 3 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_workers_are_bounded() {
        let index = Arc::new(RecordingIndex {
            delay: Duration::from_millis(20),
            ..RecordingIndex::default()
        });
        let per_doc = doc("u0").estimated_bytes();
        let indexer = BulkIndexer::start(index.clone(), config(per_doc, 2)).unwrap();
        for i in 0..12 {
            indexer.add(doc(&format!("u{i}"))).await.unwrap();
        }
        let stats = indexer.close().await.unwrap();
        assert_eq!(stats.indexed, 12);
        assert!(index.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn start_rejects_zero_flush_interval() {
        let result = BulkIndexer::start(
            Arc::new(RecordingIndex::default()),
            BulkConfig {
                flush_interval: Duration::ZERO,
                ..BulkConfig::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = BulkConfig {
            workers: 0,
            ..BulkConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(BulkConfig::default().validate().is_ok());
    }
}
