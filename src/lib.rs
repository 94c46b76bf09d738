#![warn(missing_docs)]
//! Core library for the doccrawl documentation crawler.
//!
//! Pages flow from the [`Frontier`] through the [`Extractor`] into a
//! [`PageSink`]; the [`DualPersister`] commits them to the canonical store and
//! mirrors them into the search index. The [`Reconciler`] rebuilds the index
//! from the store, and the [`QueryService`] answers searches with optional
//! external reranking.

pub mod api;
pub mod bulk;
pub mod config;
pub mod controls;
pub mod crawler;
pub mod extract;
pub mod frontier;
pub mod html;
pub mod page;
pub mod persist;
pub mod query;
pub mod ranking;
pub mod reconcile;
pub mod search;
pub mod store;

pub use bulk::{BulkConfig, BulkIndexer, BulkStats};
pub use config::ConfigError;
pub use controls::{CrawlArgs, CrawlControls};
pub use crawler::{CrawlReport, Crawler};
pub use extract::{Extractor, FetchedPage};
pub use frontier::{CrawlTask, Frontier, FrontierError};
pub use page::{IndexDocument, Page, Section, SectionKind};
pub use persist::{CanonicalOnly, DualPersister, PageSink, PersistError};
pub use query::{QueryConfig, QueryError, QueryResult, QueryService};
pub use ranking::{HttpRanker, Ranker};
pub use reconcile::{ReconcileMode, ReconcileReport, Reconciler};
pub use search::{ElasticIndex, MemoryIndex, SearchIndex};
pub use store::{CanonicalStore, MemoryStore, PgStore};
