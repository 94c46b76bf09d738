//! Query path: index retrieval, external reranking, and index-order fallback.

use crate::config::ConfigError;
use crate::ranking::{RankCandidate, RankRequest, RankResponse, Ranker};
use crate::search::{IndexError, IndexHit, SearchIndex};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Candidates fetched from the index per query.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 50;
/// Score given to every result when ranking is unavailable.
pub const FALLBACK_SCORE: f64 = 1.0;
/// Ranking gives up this long before the request deadline so the fallback can still be served.
const RANK_DEADLINE_MARGIN: Duration = Duration::from_millis(50);

/// Limits for the query path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// Index candidates requested per query.
    pub candidate_limit: usize,
    /// Deadline for the ranking call.
    pub rank_timeout: Duration,
    /// Deadline for a whole search request; must exceed `rank_timeout`.
    pub request_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            rank_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl QueryConfig {
    /// Checks the limits are usable and correctly nested.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_limit == 0 {
            return Err(ConfigError::Invalid("candidate limit must be > 0".into()));
        }
        if self.rank_timeout.is_zero() {
            return Err(ConfigError::Invalid("rank timeout must be > 0".into()));
        }
        if self.rank_timeout >= self.request_timeout {
            return Err(ConfigError::Invalid(format!(
                "rank timeout {:?} must be shorter than request timeout {:?}",
                self.rank_timeout, self.request_timeout
            )));
        }
        Ok(())
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Page title.
    pub title: String,
    /// Page URL.
    pub url: String,
    /// Ranking score, or [`FALLBACK_SCORE`] in degraded mode.
    pub score: f64,
    /// Preview: the page's first section.
    pub text: String,
}

/// Errors surfaced to query callers. Ranking failures never appear here.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The query was missing or blank.
    #[error("query must not be empty")]
    InvalidInput,
    /// The search index could not be queried.
    #[error("search index query failed: {0}")]
    Index(#[from] IndexError),
    /// The whole request exceeded its deadline.
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
}

/// Answers queries from the search index and the ranking collaborator.
pub struct QueryService {
    index: Arc<dyn SearchIndex>,
    ranker: Arc<dyn Ranker>,
    config: QueryConfig,
}

impl QueryService {
    /// Wires the service to its collaborators.
    pub fn new(index: Arc<dyn SearchIndex>, ranker: Arc<dyn Ranker>, config: QueryConfig) -> Self {
        Self {
            index,
            ranker,
            config,
        }
    }

    /// Active limits.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Runs [`QueryService::search`] under the request deadline.
    ///
    /// Dropping the returned future cancels the index query or ranking call in flight.
    /// The ranking call is cut short before the deadline, so only a slow index
    /// query can produce [`QueryError::Timeout`].
    pub async fn search_with_deadline(&self, query: &str) -> Result<Vec<QueryResult>, QueryError> {
        let deadline = Instant::now() + self.config.request_timeout;
        tokio::time::timeout_at(deadline, self.search_before(query, Some(deadline)))
            .await
            .map_err(|_| QueryError::Timeout(self.config.request_timeout))?
    }

    /// Searches the index, then reranks the candidates.
    ///
    /// When ranking fails or times out the index order is kept and every
    /// result gets [`FALLBACK_SCORE`].
    pub async fn search(&self, query: &str) -> Result<Vec<QueryResult>, QueryError> {
        self.search_before(query, None).await
    }

    async fn search_before(
        &self,
        query: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<QueryResult>, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::InvalidInput);
        }

        let hits = self.index.search(query, self.config.candidate_limit).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let request = RankRequest {
            query: query.to_string(),
            candidates: hits
                .iter()
                .map(|hit| {
                    RankCandidate::new(
                        hit.document.url.as_str(),
                        &hit.document.title,
                        hit.document.preview(),
                    )
                })
                .collect(),
        };

        let mut rank_deadline = Instant::now() + self.config.rank_timeout;
        if let Some(deadline) = deadline {
            let cutoff = deadline
                .checked_sub(RANK_DEADLINE_MARGIN)
                .unwrap_or(deadline);
            rank_deadline = rank_deadline.min(cutoff);
        }

        match tokio::time::timeout_at(rank_deadline, self.ranker.rerank(&request)).await {
            Ok(Ok(response)) => match apply_ranking(&hits, response) {
                Some(results) => Ok(results),
                None => {
                    tracing::warn!(query, "ranking matched no candidates; using index order");
                    Ok(fallback(hits))
                }
            },
            Ok(Err(err)) => {
                tracing::warn!(query, error = %err, "ranking failed; using index order");
                Ok(fallback(hits))
            }
            Err(_) => {
                tracing::warn!(
                    query,
                    rank_timeout_ms = self.config.rank_timeout.as_millis() as u64,
                    "ranking timed out or hit the request deadline; using index order"
                );
                Ok(fallback(hits))
            }
        }
    }
}

// Unknown and repeated ids are skipped; `None` when nothing maps back.
fn apply_ranking(hits: &[IndexHit], response: RankResponse) -> Option<Vec<QueryResult>> {
    let by_id: HashMap<&str, &IndexHit> = hits
        .iter()
        .map(|hit| (hit.document.url.as_str(), hit))
        .collect();
    let mut seen = HashSet::new();
    let results: Vec<QueryResult> = response
        .results
        .into_iter()
        .filter_map(|ranked| {
            let hit = by_id.get(ranked.id.as_str())?;
            seen.insert(ranked.id).then(|| result(hit, ranked.score))
        })
        .collect();
    (!results.is_empty()).then_some(results)
}

fn fallback(hits: Vec<IndexHit>) -> Vec<QueryResult> {
    hits.iter().map(|hit| result(hit, FALLBACK_SCORE)).collect()
}

fn result(hit: &IndexHit, score: f64) -> QueryResult {
    QueryResult {
        title: hit.document.title.clone(),
        url: hit.document.url.clone(),
        score,
        text: hit.document.preview().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{IndexDocument, Page, Section};
    use crate::ranking::{RankError, RankedDocument};
    use crate::search::{BulkItemResult, MemoryIndex};
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    enum Behavior {
        Fail,
        Hang,
        Respond(Vec<(&'static str, f64)>),
    }

    struct FakeRanker(Behavior);

    #[async_trait]
    impl Ranker for FakeRanker {
        async fn rerank(&self, _request: &RankRequest) -> Result<RankResponse, RankError> {
            match &self.0 {
                Behavior::Fail => Err(RankError::Config("unavailable".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(RankResponse::default())
                }
                Behavior::Respond(scores) => Ok(RankResponse {
                    results: scores
                        .iter()
                        .map(|(id, score)| RankedDocument {
                            id: id.to_string(),
                            score: *score,
                        })
                        .collect(),
                }),
            }
        }
    }

    // Delays every search before delegating to an in-memory index.
    struct SlowIndex {
        inner: MemoryIndex,
        delay: Duration,
    }

    #[async_trait]
    impl SearchIndex for SlowIndex {
        async fn ensure_index(&self, schema: &Value) -> Result<(), IndexError> {
            self.inner.ensure_index(schema).await
        }

        async fn recreate_index(&self, schema: &Value) -> Result<(), IndexError> {
            self.inner.recreate_index(schema).await
        }

        async fn index_document(&self, document: &IndexDocument) -> Result<(), IndexError> {
            self.inner.index_document(document).await
        }

        async fn bulk_index(
            &self,
            documents: &[IndexDocument],
        ) -> Result<Vec<BulkItemResult>, IndexError> {
            self.inner.bulk_index(documents).await
        }

        async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError> {
            tokio::time::sleep(self.delay).await;
            self.inner.search(query, limit).await
        }
    }

    async fn index_with(pages: &[(&str, &str, Section)]) -> MemoryIndex {
        let index = MemoryIndex::new();
        for (url, title, section) in pages {
            let page = Page {
                url: url.to_string(),
                title: title.to_string(),
                sections: vec![section.clone()],
                crawled_at: Utc::now(),
            };
            index
                .index_document(&IndexDocument::from_page(&page))
                .await
                .unwrap();
        }
        index
    }

    fn service(index: MemoryIndex, behavior: Behavior) -> QueryService {
        service_over(index, behavior)
    }

    fn service_over(index: impl SearchIndex + 'static, behavior: Behavior) -> QueryService {
        QueryService::new(
            Arc::new(index),
            Arc::new(FakeRanker(behavior)),
            QueryConfig::default(),
        )
    }

    #[tokio::test]
    async fn blank_queries_are_invalid() {
        let service = service(MemoryIndex::new(), Behavior::Fail);
        assert!(matches!(service.search("   ").await, Err(QueryError::InvalidInput)));
    }

    #[tokio::test]
    async fn empty_index_returns_empty_results() {
        let service = service(MemoryIndex::new(), Behavior::Fail);
        assert_eq!(service.search("anything").await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn ranking_failure_falls_back_to_index_results() {
        let index = index_with(&[("a", "T1", Section::code("x=1"))]).await;
        let service = service(index, Behavior::Fail);
        assert_eq!(
            service.search("x=1").await.unwrap(),
            vec![QueryResult {
                title: "T1".into(),
                url: "a".into(),
                score: 1.0,
                text: "x=1".into(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ranking_timeout_keeps_index_order() {
        let index = index_with(&[
            ("body", "other", Section::text("tokio")),
            ("title", "tokio", Section::text("intro")),
        ])
        .await;
        let service = service(index, Behavior::Hang);

        let results = service.search_with_deadline("tokio").await.unwrap();
        let urls: Vec<&str> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["title", "body"]);
        assert!(results.iter().all(|r| r.score == FALLBACK_SCORE));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_index_leaves_ranking_only_the_remaining_budget() {
        let index = SlowIndex {
            inner: index_with(&[("a", "T1", Section::code("x=1"))]).await,
            delay: Duration::from_millis(3500),
        };
        let service = QueryService::new(
            Arc::new(index),
            Arc::new(FakeRanker(Behavior::Hang)),
            QueryConfig::default(),
        );

        let started = Instant::now();
        let results = service.search_with_deadline("x=1").await.unwrap();
        assert_eq!(
            results,
            vec![QueryResult {
                title: "T1".into(),
                url: "a".into(),
                score: FALLBACK_SCORE,
                text: "x=1".into(),
            }]
        );
        assert!(started.elapsed() < QueryConfig::default().request_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_index_past_the_deadline_times_out() {
        let index = SlowIndex {
            inner: index_with(&[("a", "T1", Section::code("x=1"))]).await,
            delay: Duration::from_secs(6),
        };
        let service = service_over(index, Behavior::Fail);
        assert!(matches!(
            service.search_with_deadline("x=1").await,
            Err(QueryError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn ranking_reorders_and_skips_unknown_ids() {
        let index = index_with(&[
            ("body", "other", Section::text("tokio")),
            ("title", "tokio", Section::text("intro")),
        ])
        .await;
        let service = service(
            index,
            Behavior::Respond(vec![("body", 0.9), ("ghost", 0.8), ("title", 0.1)]),
        );

        let results = service.search("tokio").await.unwrap();
        assert_eq!(
            results,
            vec![
                QueryResult {
                    title: "other".into(),
                    url: "body".into(),
                    score: 0.9,
                    text: "tokio".into(),
                },
                QueryResult {
                    title: "tokio".into(),
                    url: "title".into(),
                    score: 0.1,
                    text: "intro".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn empty_ranking_response_falls_back() {
        let index = index_with(&[("a", "T1", Section::code("x=1"))]).await;
        let service = service(index, Behavior::Respond(Vec::new()));
        let results = service.search("x=1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, FALLBACK_SCORE);
    }

    #[test]
    fn rank_timeout_must_be_shorter_than_request_timeout() {
        assert!(QueryConfig::default().validate().is_ok());
        let config = QueryConfig {
            rank_timeout: Duration::from_secs(5),
            ..QueryConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
