//! Frontier coordination: link admission, per-run dedupe, and per-domain throttling.

use crate::controls::CrawlControls;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use url::Url;

/// Substrings that mark account pages rather than documentation.
const BLOCKED_LINK_SNIPPETS: &[&str] = &[
    "signin", "sign-in", "sign_in", "login", "log-in", "signup", "sign-up", "sign_up",
];

/// Errors that can emerge while queueing URLs into the frontier.
#[derive(Debug, thiserror::Error)]
pub enum FrontierError {
    /// The URL could not be parsed.
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        /// Raw input.
        url: String,
        /// Parser failure.
        source: url::ParseError,
    },
    /// The URL's host is not on the allowlist.
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    /// The URL was already scheduled during this run.
    #[error("already visited: {0}")]
    Duplicate(String),
    /// The per-domain gate was closed.
    #[error("domain gate closed for {0}")]
    GateClosed(String),
}

/// A unit of crawl work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    url: Url,
    depth: u8,
}

impl CrawlTask {
    /// Creates a new crawl task.
    pub fn new(url: Url, depth: u8) -> Self {
        Self { url, depth }
    }

    /// Returns the crawl depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Returns the target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host used for throttling; empty for host-less URLs.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Deduplicating work queue shared by every fetch task of one crawl run.
pub struct Frontier {
    controls: Arc<CrawlControls>,
    queue: Mutex<VecDeque<CrawlTask>>,
    visited: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<DomainGate>>>,
    pending: AtomicUsize,
}

impl Frontier {
    /// Constructs a new, empty frontier.
    pub fn new(controls: Arc<CrawlControls>) -> Self {
        Self {
            controls,
            queue: Mutex::new(VecDeque::new()),
            visited: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Number of tasks waiting inside the frontier queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of distinct URLs scheduled so far.
    pub async fn visited(&self) -> usize {
        self.visited.lock().await.len()
    }

    /// Attempts to insert a raw URL as a new crawl seed.
    pub async fn push_seed_url(&self, raw: &str) -> Result<(), FrontierError> {
        let mut url = Url::parse(raw.trim()).map_err(|source| FrontierError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        url.set_fragment(None);
        self.push_task(CrawlTask::new(url, 0)).await
    }

    /// Enqueues a task unless its host is disallowed or it was already seen.
    pub async fn push_task(&self, task: CrawlTask) -> Result<(), FrontierError> {
        if !self.controls.is_domain_allowed(task.host()) {
            return Err(FrontierError::DomainNotAllowed(task.url.to_string()));
        }

        {
            let mut visited = self.visited.lock().await;
            if !visited.insert(task.url.as_str().to_string()) {
                return Err(FrontierError::Duplicate(task.url.to_string()));
            }
        }

        let mut queue = self.queue.lock().await;
        queue.push_back(task);
        self.pending.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Pops the next task, if any. Never blocks.
    pub async fn next_task(&self) -> Option<CrawlTask> {
        let mut queue = self.queue.lock().await;
        let next = queue.pop_front();
        if next.is_some() {
            self.pending.fetch_sub(1, Ordering::Release);
        }
        next
    }

    /// Resolves `href` against `base` and applies the admission heuristics.
    ///
    /// Fragments are dropped from admitted links; query strings and percent
    /// encodings are kept as-is, so variants count as distinct URLs.
    pub fn admit_link(&self, base: &Url, href: &str) -> Option<Url> {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            return None;
        }
        let lowered = href.to_ascii_lowercase();
        if BLOCKED_LINK_SNIPPETS
            .iter()
            .any(|snippet| lowered.contains(snippet))
        {
            return None;
        }

        let mut url = base.join(href).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_fragment(None);
        let allowed = url
            .host_str()
            .map(|host| self.controls.is_domain_allowed(host))
            .unwrap_or(false);
        allowed.then_some(url)
    }

    /// Whether children of a page at `depth` should be followed.
    pub fn should_follow(&self, depth: u8) -> bool {
        self.controls
            .max_depth()
            .map(|max| depth < max)
            .unwrap_or(true)
    }

    /// Waits for a fetch slot on the task's domain.
    pub async fn acquire(&self, task: &CrawlTask) -> Result<DomainPermit, FrontierError> {
        let gate = self.gate_for(task.host()).await;
        gate.acquire().await
    }

    async fn gate_for(&self, host: &str) -> Arc<DomainGate> {
        let mut gates = self.gates.lock().await;
        let gate = gates.entry(host.to_ascii_lowercase()).or_insert_with(|| {
            Arc::new(DomainGate::new(
                host,
                self.controls.parallelism_per_domain(),
                self.controls.politeness_delay(),
            ))
        });
        Arc::clone(gate)
    }
}

/// Per-domain limiter: bounded parallelism plus a fixed spacing between request starts.
pub struct DomainGate {
    host: String,
    permits: Arc<Semaphore>,
    next_slot: Mutex<Instant>,
    delay: Duration,
}

impl DomainGate {
    /// Builds a gate allowing `parallelism` concurrent fetches spaced by `delay`.
    pub fn new(host: &str, parallelism: usize, delay: Duration) -> Self {
        Self {
            host: host.to_string(),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            next_slot: Mutex::new(Instant::now()),
            delay,
        }
    }

    /// Waits for a free slot and for the domain's next start time.
    pub async fn acquire(&self) -> Result<DomainPermit, FrontierError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FrontierError::GateClosed(self.host.clone()))?;

        let start_at = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.delay;
            slot
        };
        sleep_until(start_at).await;

        Ok(DomainPermit { _permit: permit })
    }
}

/// Held for the duration of one fetch.
pub struct DomainPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontier(domains: &[&str]) -> Frontier {
        let controls = CrawlControls::new(domains.iter().map(|d| d.to_string()).collect())
            .with_politeness_delay(Duration::from_millis(100))
            .with_parallelism(2);
        Frontier::new(Arc::new(controls))
    }

    #[tokio::test]
    async fn duplicate_urls_rejected() {
        let frontier = frontier(&["dup.test"]);
        frontier
            .push_seed_url("https://dup.test/a")
            .await
            .expect("first seed");

        let err = frontier
            .push_seed_url("https://dup.test/a#section")
            .await
            .expect_err("duplicate rejected");
        assert!(matches!(err, FrontierError::Duplicate(_)));
        assert_eq!(frontier.pending(), 1);
        assert_eq!(frontier.visited().await, 1);
    }

    #[tokio::test]
    async fn seeds_outside_allowlist_rejected() {
        let frontier = frontier(&["docs.test"]);
        let err = frontier
            .push_seed_url("https://elsewhere.test/")
            .await
            .expect_err("domain rejected");
        assert!(matches!(err, FrontierError::DomainNotAllowed(_)));
        assert!(frontier.next_task().await.is_none());
    }

    #[tokio::test]
    async fn tasks_drain_in_fifo_order() {
        let frontier = frontier(&["docs.test"]);
        frontier.push_seed_url("https://docs.test/1").await.unwrap();
        frontier.push_seed_url("https://docs.test/2").await.unwrap();

        let first = frontier.next_task().await.unwrap();
        let second = frontier.next_task().await.unwrap();
        assert_eq!(first.url().path(), "/1");
        assert_eq!(second.url().path(), "/2");
        assert_eq!(frontier.pending(), 0);
        assert!(frontier.next_task().await.is_none());
    }

    #[test]
    fn link_admission_heuristics() {
        let frontier = frontier(&["docs.test"]);
        let base = Url::parse("https://docs.test/guide/intro").unwrap();

        assert_eq!(frontier.admit_link(&base, "#install"), None);
        assert_eq!(frontier.admit_link(&base, "/account/signin"), None);
        assert_eq!(frontier.admit_link(&base, "/Login?next=/"), None);
        assert_eq!(frontier.admit_link(&base, "https://other.test/guide"), None);
        assert_eq!(frontier.admit_link(&base, "mailto:team@docs.test"), None);
        assert_eq!(frontier.admit_link(&base, "   "), None);

        let relative = frontier.admit_link(&base, "setup#step-2").unwrap();
        assert_eq!(relative.as_str(), "https://docs.test/guide/setup");

        let with_query = frontier.admit_link(&base, "/api?v=2").unwrap();
        assert_eq!(with_query.as_str(), "https://docs.test/api?v=2");
    }

    #[test]
    fn depth_limit_is_optional() {
        let unbounded = frontier(&["docs.test"]);
        assert!(unbounded.should_follow(200));

        let controls = CrawlControls::new(vec!["docs.test".into()]).with_max_depth(Some(1));
        let bounded = Frontier::new(Arc::new(controls));
        assert!(bounded.should_follow(0));
        assert!(!bounded.should_follow(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_request_starts() {
        let gate = DomainGate::new("docs.test", 4, Duration::from_millis(100));
        let origin = Instant::now();

        let _a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        let _c = gate.acquire().await.unwrap();

        let waited = origin.elapsed();
        assert!(waited >= Duration::from_millis(200), "waited {waited:?}");
        assert!(waited < Duration::from_millis(300), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn gate_bounds_parallelism() {
        let gate = Arc::new(DomainGate::new("docs.test", 2, Duration::ZERO));
        let first = gate.acquire().await.unwrap();
        let _second = gate.acquire().await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.expect("join").expect("permit");
    }
}
