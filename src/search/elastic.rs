//! Elasticsearch REST client implementing [`SearchIndex`].

use super::{BulkItemResult, IndexError, IndexHit, SearchIndex, SEARCH_FIELDS};
use crate::page::IndexDocument;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Index client bound to one Elasticsearch index.
#[derive(Clone)]
pub struct ElasticIndex {
    client: Client,
    base_url: Url,
    index: String,
}

impl ElasticIndex {
    /// Builds a client for `index` on the cluster at `base_url`.
    pub fn new(base_url: &str, index: &str) -> Result<Self, IndexError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(client, base_url, index)
    }

    /// Uses an existing HTTP client.
    pub fn with_client(client: Client, base_url: &str, index: &str) -> Result<Self, IndexError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| IndexError::Config(format!("invalid index url {base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::Config(format!(
                "index url {base_url} cannot carry a path"
            )));
        }
        let index = index.trim();
        if index.is_empty() {
            return Err(IndexError::Config("index name is required".to_string()));
        }
        Ok(Self {
            client,
            base_url,
            index: index.to_string(),
        })
    }

    /// Name of the backing index.
    pub fn index(&self) -> &str {
        &self.index
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn exists(&self) -> Result<bool, IndexError> {
        let response = self.client.head(self.endpoint(&[self.index.as_str()])).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(status_error(response).await),
        }
    }

    async fn create(&self, schema: &Value) -> Result<(), IndexError> {
        let response = self
            .client
            .put(self.endpoint(&[self.index.as_str()]))
            .json(schema)
            .send()
            .await?;
        check(response).await?;
        tracing::info!(index = %self.index, "created search index");
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn ensure_index(&self, schema: &Value) -> Result<(), IndexError> {
        if self.exists().await? {
            return Ok(());
        }
        self.create(schema).await
    }

    async fn recreate_index(&self, schema: &Value) -> Result<(), IndexError> {
        let response = self
            .client
            .delete(self.endpoint(&[self.index.as_str()]))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
            tracing::info!(index = %self.index, "deleted search index");
        }
        self.create(schema).await
    }

    async fn index_document(&self, document: &IndexDocument) -> Result<(), IndexError> {
        let mut url = self.endpoint(&[self.index.as_str(), "_doc", document.url.as_str()]);
        url.query_pairs_mut().append_pair("refresh", "true");
        let response = self.client.put(url).json(document).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn bulk_index(
        &self,
        documents: &[IndexDocument],
    ) -> Result<Vec<BulkItemResult>, IndexError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = Vec::with_capacity(documents.iter().map(IndexDocument::estimated_bytes).sum());
        for document in documents {
            let action = json!({ "index": { "_index": self.index, "_id": document.url } });
            serde_json::to_writer(&mut body, &action)?;
            body.push(b'\n');
            serde_json::to_writer(&mut body, document)?;
            body.push(b'\n');
        }

        let response = self
            .client
            .post(self.endpoint(&["_bulk"]))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))
            .body(body)
            .send()
            .await?;
        let parsed: BulkResponse = check(response).await?.json().await?;

        let mut items = parsed.items.into_iter();
        let results = documents
            .iter()
            .map(|document| match items.next().and_then(BulkItem::from_action) {
                Some(item) => item.into_result(&document.url),
                None => BulkItemResult::failed(&document.url, "missing bulk response item"),
            })
            .collect();
        Ok(results)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError> {
        let request = json!({
            "size": limit,
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": SEARCH_FIELDS,
                    "fuzziness": "AUTO"
                }
            }
        });
        let response = self
            .client
            .post(self.endpoint(&[self.index.as_str(), "_search"]))
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(index = %self.index, "search index missing; returning no hits");
            return Ok(Vec::new());
        }
        let parsed: SearchResponse = check(response).await?.json().await?;
        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| IndexHit {
                document: hit.source,
                score: hit.score.unwrap_or_default(),
            })
            .collect())
    }
}

async fn check(response: Response) -> Result<Response, IndexError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: Response) -> IndexError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    IndexError::Status { status, body }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl BulkItem {
    // Each item is keyed by its action name; only `index` is ever sent.
    fn from_action(mut action: HashMap<String, BulkItem>) -> Option<Self> {
        action.remove("index")
    }

    fn into_result(self, id: &str) -> BulkItemResult {
        match self.error {
            Some(error) => {
                let reason = error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                BulkItemResult::failed(id, reason)
            }
            None if self.status >= 300 => {
                BulkItemResult::failed(id, format!("status {}", self.status))
            }
            None => BulkItemResult::ok(id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: IndexDocument,
}
