//! Page persistence targets: canonical store only, or canonical store mirrored into the index.

use crate::page::{IndexDocument, InvalidPage, Page};
use crate::search::SearchIndex;
use crate::store::{CanonicalStore, StoreError};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of lock stripes used to serialize saves of the same URL.
const URL_LOCK_STRIPES: usize = 64;

/// Errors surfaced by a [`PageSink`].
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The page failed validation and was never written.
    #[error("page rejected: {0}")]
    Invalid(#[from] InvalidPage),
    /// The canonical write failed and was rolled back.
    #[error("canonical write failed for {url}: {source}")]
    Store {
        /// Page URL.
        url: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
}

/// Destination for extracted pages.
#[async_trait]
pub trait PageSink: Send + Sync {
    /// Persists `page`. An error means the canonical copy was not written.
    async fn save(&self, page: &Page) -> Result<(), PersistError>;
}

/// Writes pages to the canonical store only.
pub struct CanonicalOnly {
    store: Arc<dyn CanonicalStore>,
}

impl CanonicalOnly {
    /// Wraps a canonical store.
    pub fn new(store: Arc<dyn CanonicalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PageSink for CanonicalOnly {
    async fn save(&self, page: &Page) -> Result<(), PersistError> {
        page.validate()?;
        let page_id = write_canonical(self.store.as_ref(), page).await?;
        tracing::info!(
            url = %page.url,
            title = %page.title,
            sections = page.sections.len(),
            page_id,
            "saved page"
        );
        Ok(())
    }
}

/// Commits pages to the canonical store, then mirrors them into the search index.
///
/// The index write is best effort: a failure is logged and the save still
/// succeeds, leaving the reconciler to repair the drift. Saves of the same URL
/// are serialized so their store and index writes never interleave.
pub struct DualPersister {
    store: Arc<dyn CanonicalStore>,
    index: Arc<dyn SearchIndex>,
    stripes: Vec<Mutex<()>>,
}

impl DualPersister {
    /// Composes a canonical store with a search index.
    pub fn new(store: Arc<dyn CanonicalStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            store,
            index,
            stripes: (0..URL_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, url: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        let slot = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[slot]
    }
}

#[async_trait]
impl PageSink for DualPersister {
    async fn save(&self, page: &Page) -> Result<(), PersistError> {
        page.validate()?;

        let _guard = self.stripe(&page.url).lock().await;
        let page_id = write_canonical(self.store.as_ref(), page).await?;

        let document = IndexDocument::from_page(page);
        if let Err(err) = self.index.index_document(&document).await {
            tracing::warn!(
                url = %page.url,
                error = %err,
                "search index write failed; canonical copy kept"
            );
        }

        tracing::info!(
            url = %page.url,
            title = %page.title,
            sections = page.sections.len(),
            page_id,
            "saved page"
        );
        Ok(())
    }
}

async fn write_canonical(store: &dyn CanonicalStore, page: &Page) -> Result<i64, PersistError> {
    store
        .save_page(page)
        .await
        .map_err(|source| PersistError::Store {
            url: page.url.clone(),
            source,
        })
}
