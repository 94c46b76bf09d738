//! Canonical page storage: the durable source of truth for crawled pages.

pub mod memory;
pub mod postgres;

use crate::page::{InvalidPage, Page, UnknownSectionKind};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Default number of pages fetched per cursor round trip.
pub const DEFAULT_STREAM_BATCH: usize = 256;

/// Errors raised by canonical store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The driver reported a failure.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The page violates a storage invariant.
    #[error(transparent)]
    InvalidPage(#[from] InvalidPage),
    /// Stored data could not be decoded back into a page.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<UnknownSectionKind> for StoreError {
    fn from(err: UnknownSectionKind) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Authoritative storage for pages and their ordered sections.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Atomically upserts the page row and replaces all of its sections.
    ///
    /// Returns the page id. On error nothing is committed.
    async fn save_page(&self, page: &Page) -> Result<i64, StoreError>;

    /// Reads a page and its sections back by URL.
    async fn load_page(&self, url: &str) -> Result<Option<Page>, StoreError>;

    /// Streams every stored page without materializing the whole table.
    ///
    /// An error returned here means the store was unreachable at stream start;
    /// errors while streaming arrive as items.
    async fn stream_pages(&self, batch_size: usize) -> Result<PageStream, StoreError>;
}

/// Bounded channel of pages produced by a background reader.
pub struct PageStream {
    rx: mpsc::Receiver<Result<Page, StoreError>>,
}

impl PageStream {
    /// Creates a stream and the sender its producer writes into.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Page, StoreError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Next page, or `None` once the producer finished.
    pub async fn next(&mut self) -> Option<Result<Page, StoreError>> {
        self.rx.recv().await
    }
}
