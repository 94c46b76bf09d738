//! Crawl runner: drives the frontier, fetches pages, extracts them, and hands them to a sink.

use crate::config::ConfigError;
use crate::controls::CrawlControls;
use crate::extract::{Extractor, FetchedPage};
use crate::frontier::{CrawlTask, Frontier, FrontierError};
use crate::html::{collect_links, read_body};
use crate::persist::PageSink;
use chrono::Utc;
use reqwest::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

const USER_AGENT: &str = "doccrawl/0.1 (+documentation indexer)";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised before a crawl can start.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// The crawl controls are unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Counters collected over one crawl run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Pages fetched with a success status and a readable body.
    pub pages_fetched: usize,
    /// Pages accepted by the sink.
    pub pages_saved: usize,
    /// Pages the sink rejected.
    pub save_failures: usize,
    /// Content containers dropped for having no sections.
    pub containers_discarded: usize,
    /// Links admitted from fetched pages.
    pub links_discovered: usize,
    /// Links newly scheduled.
    pub links_enqueued: usize,
    /// Links skipped because they were already scheduled.
    pub duplicates_skipped: usize,
    /// Fetches that failed or returned a non-success status.
    pub fetch_errors: usize,
    /// Documents that could not be extracted or scanned.
    pub extract_errors: usize,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Crawls documentation sites into a [`PageSink`].
pub struct Crawler {
    client: Client,
    controls: Arc<CrawlControls>,
    extractor: Extractor,
    sink: Arc<dyn PageSink>,
}

// State of one `run`; the frontier and counters start empty every time.
struct Shared {
    client: Client,
    controls: Arc<CrawlControls>,
    frontier: Frontier,
    extractor: Extractor,
    sink: Arc<dyn PageSink>,
    metrics: Metrics,
}

impl Crawler {
    /// Builds a crawler with its own HTTP client.
    pub fn new(controls: CrawlControls, sink: Arc<dyn PageSink>) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Self::with_client(client, controls, sink)
    }

    /// Builds a crawler around an existing HTTP client.
    pub fn with_client(
        client: Client,
        controls: CrawlControls,
        sink: Arc<dyn PageSink>,
    ) -> Result<Self, CrawlError> {
        controls.validate()?;
        Ok(Self {
            client,
            controls: Arc::new(controls),
            extractor: Extractor::new(),
            sink,
        })
    }

    /// Crawls from `seeds` until no fetch is pending or in flight.
    pub async fn run(&self, seeds: &[String]) -> CrawlReport {
        let started = Instant::now();
        let shared = Arc::new(Shared {
            client: self.client.clone(),
            controls: Arc::clone(&self.controls),
            frontier: Frontier::new(Arc::clone(&self.controls)),
            extractor: self.extractor.clone(),
            sink: Arc::clone(&self.sink),
            metrics: Metrics::default(),
        });
        for seed in seeds {
            if let Err(err) = shared.frontier.push_seed_url(seed).await {
                tracing::warn!(seed = %seed, error = %err, "seed rejected");
            }
        }

        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.len() < shared.controls.max_in_flight() {
                let Some(task) = shared.frontier.next_task().await else {
                    break;
                };
                in_flight.spawn(crawl_one(Arc::clone(&shared), task));
            }

            match in_flight.join_next().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::error!(error = %err, "fetch task aborted");
                    shared.metrics.fetch_errors.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        let report = shared.metrics.report(started.elapsed());
        tracing::info!(
            pages_fetched = report.pages_fetched,
            pages_saved = report.pages_saved,
            save_failures = report.save_failures,
            containers_discarded = report.containers_discarded,
            links_discovered = report.links_discovered,
            links_enqueued = report.links_enqueued,
            duplicates_skipped = report.duplicates_skipped,
            fetch_errors = report.fetch_errors,
            extract_errors = report.extract_errors,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "crawl finished"
        );
        report
    }
}

async fn crawl_one(shared: Arc<Shared>, task: CrawlTask) {
    let url = task.url().clone();
    tracing::debug!(depth = task.depth(), url = %url, "fetching");

    let body = {
        let _permit = match shared.frontier.acquire(&task).await {
            Ok(permit) => permit,
            Err(err) => {
                shared.metrics.record_fetch_error(&url, &err);
                return;
            }
        };
        let response = match shared.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                shared.metrics.record_fetch_error(&url, &err);
                return;
            }
        };
        let status = response.status();
        if !status.is_success() {
            shared
                .metrics
                .record_fetch_error(&url, &format!("unexpected status {status}"));
            return;
        }
        match read_body(response, shared.controls.max_body_bytes()).await {
            Ok(body) => body,
            Err(err) => {
                shared.metrics.record_fetch_error(&url, &err);
                return;
            }
        }
    };
    shared.metrics.pages_fetched.fetch_add(1, Ordering::Relaxed);

    let fetched = FetchedPage::new(url.clone(), task.depth(), Utc::now(), body);
    match shared.extractor.extract(&fetched) {
        Ok(extraction) => {
            if extraction.lossy_decoding {
                tracing::debug!(url = %url, "body was not valid UTF-8; decoded lossily");
            }
            if extraction.discarded > 0 {
                tracing::debug!(
                    url = %url,
                    containers = extraction.discarded,
                    "discarded containers without sections"
                );
                shared
                    .metrics
                    .containers_discarded
                    .fetch_add(extraction.discarded, Ordering::Relaxed);
            }
            for page in &extraction.pages {
                match shared.sink.save(page).await {
                    Ok(()) => {
                        shared.metrics.pages_saved.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "failed to save page");
                        shared.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "extraction failed");
            shared.metrics.extract_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    if !shared.frontier.should_follow(task.depth()) {
        return;
    }
    let links = match collect_links(
        &fetched.body,
        shared.controls.max_links_per_page(),
        |href| shared.frontier.admit_link(&url, href),
    ) {
        Ok(links) => links,
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "link scan failed");
            shared.metrics.extract_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let child_depth = task.depth().saturating_add(1);
    for link in links {
        shared.metrics.links_discovered.fetch_add(1, Ordering::Relaxed);
        match shared.frontier.push_task(CrawlTask::new(link, child_depth)).await {
            Ok(()) => {
                shared.metrics.links_enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(FrontierError::Duplicate(_)) => {
                shared.metrics.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(error = %err, "link rejected by frontier");
            }
        }
    }
}

#[derive(Default)]
struct Metrics {
    pages_fetched: AtomicUsize,
    pages_saved: AtomicUsize,
    save_failures: AtomicUsize,
    containers_discarded: AtomicUsize,
    links_discovered: AtomicUsize,
    links_enqueued: AtomicUsize,
    duplicates_skipped: AtomicUsize,
    fetch_errors: AtomicUsize,
    extract_errors: AtomicUsize,
}

impl Metrics {
    fn record_fetch_error(&self, url: &url::Url, err: &dyn std::fmt::Display) {
        tracing::warn!(url = %url, error = %err, "fetch failed; skipping");
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, elapsed: Duration) -> CrawlReport {
        CrawlReport {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_saved: self.pages_saved.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            containers_discarded: self.containers_discarded.load(Ordering::Relaxed),
            links_discovered: self.links_discovered.load(Ordering::Relaxed),
            links_enqueued: self.links_enqueued.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            extract_errors: self.extract_errors.load(Ordering::Relaxed),
            elapsed,
        }
    }
}
