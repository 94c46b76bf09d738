use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doccrawl::ranking::{RankError, RankRequest, RankResponse};
use doccrawl::{
    CanonicalStore, CrawlControls, Crawler, DualPersister, MemoryIndex, MemoryStore, QueryConfig,
    QueryService, Ranker, ReconcileMode, Reconciler, SearchIndex, SectionKind,
};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOME: &str = r#"
<html>
  <head><title>Docs Home</title></head>
  <body>
    <nav><a href="/login">Log in</a></nav>
    <article>
      <h1>Welcome</h1>
      <p>Start with the guide.</p>
      <a href="/guide">Guide</a>
      <a href="/guide#install">Install</a>
      <a href="/missing">Missing</a>
      <a href="/empty">Empty</a>
      <a href="https://external.test/page">Elsewhere</a>
    </article>
  </body>
</html>
"#;

const GUIDE: &str = r#"
<html>
  <head><title>Guide</title></head>
  <body>
    <main>
      <h1>Getting started</h1>
      <h2>Install</h2>
      <pre>cargo install doccrawl</pre>
      <p>Then run the crawler.</p>
      <a href="/">Home</a>
    </main>
  </body>
</html>
"#;

const EMPTY: &str = r#"<html><body><main><h1>Nothing here</h1></main></body></html>"#;

struct UnavailableRanker;

#[async_trait]
impl Ranker for UnavailableRanker {
    async fn rerank(&self, _request: &RankRequest) -> Result<RankResponse, RankError> {
        Err(RankError::Config("ranking service offline".into()))
    }
}

async fn mock_site() -> MockServer {
    let server = MockServer::start().await;
    for (route, body) in [("/", HOME), ("/guide", GUIDE), ("/empty", EMPTY)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;
    }
    server
}

fn controls() -> CrawlControls {
    CrawlControls::new(vec!["127.0.0.1".into()])
        .with_parallelism(2)
        .with_politeness_delay(Duration::ZERO)
}

#[tokio::test]
async fn crawl_persists_extracted_pages_and_serves_queries() {
    let server = mock_site().await;
    let store = MemoryStore::new();
    let index = MemoryIndex::new();
    let sink = Arc::new(DualPersister::new(
        Arc::new(store.clone()),
        Arc::new(index.clone()),
    ));

    let crawler = Crawler::new(controls(), sink).unwrap();
    let report = crawler.run(&[format!("{}/", server.uri())]).await;

    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.pages_saved, 2);
    assert_eq!(report.containers_discarded, 1);
    assert_eq!(report.fetch_errors, 1);
    assert_eq!(report.links_discovered, 5);
    assert_eq!(report.links_enqueued, 3);
    assert_eq!(report.duplicates_skipped, 2);
    assert_eq!(store.len().await, 2);

    let guide = store
        .load_page(&format!("{}/guide", server.uri()))
        .await
        .unwrap()
        .expect("guide stored");
    assert_eq!(guide.title, "Getting started");
    let kinds: Vec<SectionKind> = guide.sections.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![SectionKind::Text, SectionKind::Code, SectionKind::Text]
    );
    assert_eq!(guide.sections[0].content, "## Install");
    assert_eq!(guide.sections[1].content, "cargo install doccrawl");

    let service = QueryService::new(
        Arc::new(index.clone()),
        Arc::new(UnavailableRanker),
        QueryConfig::default(),
    );
    let results = service.search("cargo install").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].url, format!("{}/guide", server.uri()));
    assert_eq!(results[0].score, 1.0);
    assert_eq!(results[0].text, "## Install");
}

#[tokio::test]
async fn reconcile_restores_a_lost_index() {
    let server = mock_site().await;
    let store = MemoryStore::new();
    let index = MemoryIndex::new();
    let sink = Arc::new(DualPersister::new(
        Arc::new(store.clone()),
        Arc::new(index.clone()),
    ));
    Crawler::new(controls(), sink)
        .unwrap()
        .run(&[format!("{}/", server.uri())])
        .await;

    index
        .recreate_index(&serde_json::Value::Null)
        .await
        .unwrap();
    assert!(index.is_empty().await);

    let report = Reconciler::new(Arc::new(store.clone()), Arc::new(index.clone()))
        .run(ReconcileMode::Resync)
        .await
        .unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(index.len().await, 2);
}

#[tokio::test]
async fn depth_limit_stops_link_following() {
    let server = mock_site().await;
    let store = MemoryStore::new();
    let sink = Arc::new(DualPersister::new(
        Arc::new(store.clone()),
        Arc::new(MemoryIndex::new()),
    ));

    let report = Crawler::new(controls().with_max_depth(Some(0)), sink)
        .unwrap()
        .run(&[format!("{}/", server.uri())])
        .await;
    assert_eq!(report.pages_fetched, 1);
    assert_eq!(report.links_discovered, 0);
    assert_eq!(store.len().await, 1);
}
