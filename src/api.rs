//! HTTP surface for the query service.

use crate::query::{QueryError, QueryResult, QueryService};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MISSING_QUERY: &str = "Query parameter 'q' is required";

#[derive(Clone)]
struct AppState {
    service: Arc<QueryService>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

/// Body returned by `GET /search`.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Query as received.
    pub query: String,
    /// Number of results.
    pub count: usize,
    /// Ranked results.
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Builds the router serving `/search` and `/healthz`.
pub fn router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/search", get(search))
        .with_state(AppState { service })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let Some(query) = params.q.filter(|q| !q.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, MISSING_QUERY);
    };

    match state.service.search_with_deadline(&query).await {
        Ok(results) => {
            let body = SearchResponse {
                query,
                count: results.len(),
                results,
            };
            with_cors(Json(body))
        }
        Err(QueryError::InvalidInput) => error_response(StatusCode::BAD_REQUEST, MISSING_QUERY),
        Err(err) => {
            tracing::error!(query = %query, error = %err, "search failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Search failed: {err}"),
            )
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        error: message.to_string(),
    };
    with_cors((status, Json(body)))
}

fn with_cors(response: impl IntoResponse) -> Response {
    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], response).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{IndexDocument, Page, Section};
    use crate::query::QueryConfig;
    use crate::ranking::{RankError, RankRequest, RankResponse, Ranker};
    use crate::search::{BulkItemResult, IndexError, IndexHit, MemoryIndex, SearchIndex};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};

    struct DownRanker;

    #[async_trait]
    impl Ranker for DownRanker {
        async fn rerank(&self, _request: &RankRequest) -> Result<RankResponse, RankError> {
            Err(RankError::Config("connection refused".into()))
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl SearchIndex for BrokenIndex {
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
            _documents: &[IndexDocument],
        ) -> Result<Vec<BulkItemResult>, IndexError> {
            Ok(Vec::new())
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<IndexHit>, IndexError> {
            Err(IndexError::Status {
                status: 503,
                body: "red cluster".into(),
            })
        }
    }

    async fn serve(index: Arc<dyn SearchIndex>) -> String {
        let service = QueryService::new(index, Arc::new(DownRanker), QueryConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(service))).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn seeded_index() -> Arc<dyn SearchIndex> {
        let index = MemoryIndex::new();
        let page = Page {
            url: "a".into(),
            title: "T1".into(),
            sections: vec![Section::code("x=1")],
            crawled_at: Utc::now(),
        };
        index
            .index_document(&IndexDocument::from_page(&page))
            .await
            .unwrap();
        Arc::new(index)
    }

    #[tokio::test]
    async fn search_returns_fallback_results() {
        let base = serve(seeded_index().await).await;
        let response = reqwest::get(format!("{base}/search?q=x%3D1")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
        let body: Value = response.json().await.unwrap();
        assert_eq!(
            body,
            json!({
                "query": "x=1",
                "count": 1,
                "results": [{"title": "T1", "url": "a", "score": 1.0, "text": "x=1"}]
            })
        );
    }

    #[tokio::test]
    async fn missing_query_is_a_client_error() {
        let base = serve(seeded_index().await).await;
        for path in ["/search", "/search?q=", "/search?q=%20%20"] {
            let response = reqwest::get(format!("{base}{path}")).await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{path}");
            let body: Value = response.json().await.unwrap();
            assert_eq!(body, json!({"error": MISSING_QUERY}));
        }
    }

    #[tokio::test]
    async fn index_failure_is_a_server_error() {
        let base = serve(Arc::new(BrokenIndex)).await;
        let response = reqwest::get(format!("{base}/search?q=tokio")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn empty_results_are_not_an_error() {
        let base = serve(Arc::new(MemoryIndex::new())).await;
        let body: Value = reqwest::get(format!("{base}/search?q=nothing"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"query": "nothing", "count": 0, "results": []}));
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let base = serve(Arc::new(MemoryIndex::new())).await;
        let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }
}
