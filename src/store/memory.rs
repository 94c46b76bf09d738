//! In-process canonical store for tests and dry runs.

use super::{CanonicalStore, PageStream, StoreError};
use crate::page::Page;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    next_id: i64,
    pages: BTreeMap<String, (i64, Page)>,
}

/// Canonical store backed by an ordered map keyed by URL.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pages.
    pub async fn len(&self) -> usize {
        self.tables.lock().await.pages.len()
    }

    /// True when no pages are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn save_page(&self, page: &Page) -> Result<i64, StoreError> {
        page.validate()?;
        let mut tables = self.tables.lock().await;
        let id = match tables.pages.get(&page.url) {
            Some((id, _)) => *id,
            None => {
                tables.next_id += 1;
                tables.next_id
            }
        };
        tables.pages.insert(page.url.clone(), (id, page.clone()));
        Ok(id)
    }

    async fn load_page(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.pages.get(url).map(|(_, page)| page.clone()))
    }

    async fn stream_pages(&self, batch_size: usize) -> Result<PageStream, StoreError> {
        let batch_size = batch_size.max(1);
        let (tx, stream) = PageStream::channel(batch_size);
        let tables = Arc::clone(&self.tables);
        tokio::spawn(async move {
            let mut after: Option<String> = None;
            loop {
                let batch: Vec<Page> = {
                    let guard = tables.lock().await;
                    let lower = match &after {
                        Some(url) => Bound::Excluded(url.clone()),
                        None => Bound::Unbounded,
                    };
                    guard
                        .pages
                        .range((lower, Bound::Unbounded))
                        .take(batch_size)
                        .map(|(_, (_, page))| page.clone())
                        .collect()
                };
                let Some(last) = batch.last() else {
                    return;
                };
                after = Some(last.url.clone());
                for page in batch {
                    if tx.send(Ok(page)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Section;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn page(url: &str, sections: Vec<Section>) -> Page {
        Page {
            url: url.into(),
            title: format!("title of {url}"),
            sections,
            crawled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_load_preserves_order() {
        let store = MemoryStore::new();
        let original = page(
            "https://docs.test/a",
            vec![
                Section::text("## Intro"),
                Section::code("let x = 1;"),
                Section::text("Done."),
            ],
        );
        store.save_page(&original).await.unwrap();
        let loaded = store.load_page(&original.url).await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn resave_replaces_sections_and_keeps_id() {
        let store = MemoryStore::new();
        let first = page("u", vec![Section::text("one"), Section::text("two")]);
        let second = page("u", vec![Section::code("three")]);

        let id_a = store.save_page(&first).await.unwrap();
        let id_b = store.save_page(&second).await.unwrap();
        assert_eq!(id_a, id_b);

        let loaded = store.load_page("u").await.unwrap().unwrap();
        assert_eq!(loaded.sections, vec![Section::code("three")]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn rejects_pages_without_sections() {
        let store = MemoryStore::new();
        let err = store.save_page(&page("u", Vec::new())).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPage(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn streams_every_page_in_batches() {
        let store = MemoryStore::new();
        for i in 0..7 {
            store
                .save_page(&page(&format!("u{i}"), vec![Section::text("t")]))
                .await
                .unwrap();
        }

        let mut stream = store.stream_pages(3).await.unwrap();
        let mut seen = Vec::new();
        while let Some(page) = stream.next().await {
            seen.push(page.unwrap().url);
        }
        assert_eq!(seen, vec!["u0", "u1", "u2", "u3", "u4", "u5", "u6"]);
    }
}
