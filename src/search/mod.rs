//! Derived full-text search index over crawled pages.

pub mod elastic;
pub mod memory;
pub mod schema;

use crate::page::IndexDocument;
use async_trait::async_trait;
use serde_json::Value;

pub use elastic::ElasticIndex;
pub use memory::MemoryIndex;

/// Weighted fields searched by every query, highest weight first.
pub const SEARCH_FIELDS: [&str; 3] = ["title^3", "code_snippets^2", "content"];

/// Errors raised by search index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Transport failure talking to the index.
    #[error("index http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The index answered with a non-success status.
    #[error("index returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// A payload could not be encoded or decoded.
    #[error("index payload error: {0}")]
    Json(#[from] serde_json::Error),
    /// The configured endpoint or schema is unusable.
    #[error("invalid index configuration: {0}")]
    Config(String),
}

/// One search hit with the index's relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    /// Stored document.
    pub document: IndexDocument,
    /// Engine relevance score; higher is better.
    pub score: f64,
}

/// Outcome for one document of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    /// Document id (page URL).
    pub id: String,
    /// Failure reason, `None` on success.
    pub error: Option<String>,
}

impl BulkItemResult {
    /// Successful item.
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    /// Failed item with a reason.
    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(reason.into()),
        }
    }

    /// True when the item was written.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Secondary store optimized for full-text retrieval. Never authoritative.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the index from `schema` unless it already exists.
    async fn ensure_index(&self, schema: &Value) -> Result<(), IndexError>;

    /// Deletes the index if present, then creates it from `schema`.
    async fn recreate_index(&self, schema: &Value) -> Result<(), IndexError>;

    /// Upserts one document keyed by its URL.
    async fn index_document(&self, document: &IndexDocument) -> Result<(), IndexError>;

    /// Upserts a batch, reporting an outcome per document in input order.
    ///
    /// An `Err` means the whole request failed and no item outcome is known.
    async fn bulk_index(&self, documents: &[IndexDocument])
        -> Result<Vec<BulkItemResult>, IndexError>;

    /// Returns up to `limit` hits ordered by descending relevance.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError>;
}
