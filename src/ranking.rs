//! Client for the external reranking collaborator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

/// Longest candidate snippet sent for ranking, in characters.
pub const MAX_SNIPPET_CHARS: usize = 512;

/// One document offered for reranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankCandidate {
    /// Document id (page URL).
    pub id: String,
    /// Page title.
    pub title: String,
    /// Short text used for relevance scoring.
    pub content_snippet: String,
}

impl RankCandidate {
    /// Builds a candidate whose snippet is the title followed by the first section.
    pub fn new(id: impl Into<String>, title: &str, first_section: &str) -> Self {
        let mut snippet = title.to_string();
        if !first_section.is_empty() {
            snippet.push(' ');
            snippet.push_str(first_section);
        }
        Self {
            id: id.into(),
            title: title.to_string(),
            content_snippet: truncate_chars(&snippet, MAX_SNIPPET_CHARS).to_string(),
        }
    }
}

/// Request payload for a rerank call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRequest {
    /// User query.
    pub query: String,
    /// Candidates in index order.
    pub candidates: Vec<RankCandidate>,
}

/// Score assigned to one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    /// Candidate id.
    pub id: String,
    /// Relative relevance signal; not bounded.
    pub score: f64,
}

/// Candidates in the collaborator's preferred order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankResponse {
    /// Ranked documents, best first.
    #[serde(default)]
    pub results: Vec<RankedDocument>,
}

/// Errors raised by a [`Ranker`].
#[derive(Debug, thiserror::Error)]
pub enum RankError {
    /// Transport or decode failure.
    #[error("ranking request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The collaborator answered with a non-success status.
    #[error("ranking service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// The endpoint URL is unusable.
    #[error("invalid ranking endpoint: {0}")]
    Config(String),
}

/// Reorders candidates by relevance to a query.
#[async_trait]
pub trait Ranker: Send + Sync {
    /// Scores `request.candidates` against `request.query`.
    async fn rerank(&self, request: &RankRequest) -> Result<RankResponse, RankError>;
}

/// JSON-over-HTTP ranking client posting to `{base}/rerank`.
#[derive(Clone)]
pub struct HttpRanker {
    client: Client,
    endpoint: Url,
}

impl HttpRanker {
    /// Builds a client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, RankError> {
        Self::with_client(Client::builder().build()?, base_url)
    }

    /// Uses an existing HTTP client.
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, RankError> {
        let base = format!("{}/", base_url.trim().trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|base| base.join("rerank"))
            .map_err(|err| RankError::Config(format!("{base_url}: {err}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Ranker for HttpRanker {
    async fn rerank(&self, request: &RankRequest) -> Result<RankResponse, RankError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RankError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

fn truncate_chars(input: &str, max: usize) -> &str {
    match input.char_indices().nth(max) {
        Some((end, _)) => &input[..end],
        None => input,
    }
}
