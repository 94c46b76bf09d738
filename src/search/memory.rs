//! In-process search index: weighted term matching with small-edit fuzziness.

use super::{BulkItemResult, IndexError, IndexHit, SearchIndex};
use crate::page::IndexDocument;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TITLE_WEIGHT: f64 = 3.0;
const CODE_WEIGHT: f64 = 2.0;
const CONTENT_WEIGHT: f64 = 1.0;
const FUZZY_FACTOR: f64 = 0.5;

/// Search index kept in memory, keyed by URL.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    documents: Arc<Mutex<BTreeMap<String, IndexDocument>>>,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document for `url`, if any.
    pub async fn get(&self, url: &str) -> Option<IndexDocument> {
        self.documents.lock().await.get(url).cloned()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// True when nothing is indexed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_index(&self, _schema: &Value) -> Result<(), IndexError> {
        Ok(())
    }

    async fn recreate_index(&self, _schema: &Value) -> Result<(), IndexError> {
        self.documents.lock().await.clear();
        Ok(())
    }

    async fn index_document(&self, document: &IndexDocument) -> Result<(), IndexError> {
        self.documents
            .lock()
            .await
            .insert(document.url.clone(), document.clone());
        Ok(())
    }

    async fn bulk_index(
        &self,
        documents: &[IndexDocument],
    ) -> Result<Vec<BulkItemResult>, IndexError> {
        let mut stored = self.documents.lock().await;
        Ok(documents
            .iter()
            .map(|document| {
                stored.insert(document.url.clone(), document.clone());
                BulkItemResult::ok(&document.url)
            })
            .collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let stored = self.documents.lock().await;
        let mut hits: Vec<IndexHit> = stored
            .values()
            .filter_map(|document| {
                let score = score_document(&terms, document);
                (score > 0.0).then(|| IndexHit {
                    document: document.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.url.cmp(&b.document.url))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn score_document(terms: &[String], document: &IndexDocument) -> f64 {
    let fields = [
        (tokenize(&document.title), TITLE_WEIGHT),
        (tokenize(&document.code_snippets), CODE_WEIGHT),
        (tokenize(&document.content), CONTENT_WEIGHT),
    ];
    terms
        .iter()
        .map(|term| {
            fields
                .iter()
                .map(|(tokens, weight)| weight * field_score(term, tokens))
                .fold(0.0, f64::max)
        })
        .sum()
}

// Best match of one query term against a field's tokens.
fn field_score(term: &str, tokens: &[String]) -> f64 {
    let allowed = allowed_edits(term);
    let mut best: f64 = 0.0;
    for token in tokens {
        if token == term {
            return 1.0;
        }
        if allowed > 0 && within_edits(term, token, allowed) {
            best = FUZZY_FACTOR;
        }
    }
    best
}

// Same thresholds as Elasticsearch `fuzziness: AUTO`.
fn allowed_edits(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

fn within_edits(a: &str, b: &str, allowed: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > allowed {
        return false;
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        previous = current;
    }
    previous[b.len()] <= allowed
}

fn tokenize(input: &str) -> Vec<String> {
    input
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}
