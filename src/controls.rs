//! Crawl throttle and filtering controls.

use crate::config::ConfigError;
use clap::Args;
use std::time::Duration;

/// Tunable knobs that bound crawl behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrawlControls {
    allowed_domains: Vec<String>,
    parallelism_per_domain: usize,
    politeness_delay: Duration,
    max_depth: Option<u8>,
    max_links_per_page: usize,
    max_in_flight: usize,
    max_body_bytes: usize,
}

impl CrawlControls {
    /// Constructs controls for the given domain allowlist with default limits.
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .into_iter()
                .map(|domain| domain.trim().to_ascii_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect(),
            ..Self::default()
        }
    }

    /// Overrides the number of concurrent fetches allowed per domain.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism_per_domain = parallelism;
        self
    }

    /// Overrides the fixed delay between requests to one domain.
    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    /// Limits how many links deep the crawl follows from a seed.
    pub fn with_max_depth(mut self, depth: Option<u8>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Caps the number of links admitted from a single page.
    pub fn with_max_links_per_page(mut self, limit: usize) -> Self {
        self.max_links_per_page = limit;
        self
    }

    /// Caps the number of fetch tasks alive at once across all domains.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Skips response bodies larger than `limit` bytes.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Returns the allowlist of domains.
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Concurrent fetches allowed per domain.
    pub fn parallelism_per_domain(&self) -> usize {
        self.parallelism_per_domain
    }

    /// Time to wait between successive requests to one domain.
    pub fn politeness_delay(&self) -> Duration {
        self.politeness_delay
    }

    /// Maximum crawl depth, if bounded.
    pub fn max_depth(&self) -> Option<u8> {
        self.max_depth
    }

    /// Maximum number of links extracted per page.
    pub fn max_links_per_page(&self) -> usize {
        self.max_links_per_page
    }

    /// Maximum number of fetch tasks alive at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Largest response body accepted.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Determines whether the provided host passes the allowlist.
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }

    /// Rejects settings that would stall or never start a crawl.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_domains.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one allowed domain is required".into(),
            ));
        }
        if self.parallelism_per_domain == 0 {
            return Err(ConfigError::Invalid(
                "parallelism per domain must be greater than 0".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "max in-flight fetches must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CrawlControls {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            parallelism_per_domain: 4,
            politeness_delay: Duration::from_secs(1),
            max_depth: None,
            max_links_per_page: 512,
            max_in_flight: 64,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Command-line flags for binaries that crawl.
#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Domain allowlist, comma separated
    #[arg(
        long,
        env = "DOCCRAWL_DOMAINS",
        default_value = "go.dev,docs.rs,doc.rust-lang.org,rust-lang.org"
    )]
    pub allowed_domains: String,

    /// Concurrent fetches allowed per domain
    #[arg(long, env = "DOCCRAWL_PARALLELISM", default_value_t = 4)]
    pub parallelism: usize,

    /// Milliseconds to wait between requests to the same domain
    #[arg(long, env = "DOCCRAWL_DELAY_MS", default_value_t = 1000)]
    pub delay_ms: u64,

    /// Maximum crawl depth (unbounded when omitted)
    #[arg(long, env = "DOCCRAWL_MAX_DEPTH")]
    pub max_depth: Option<u8>,

    /// Maximum links admitted per page
    #[arg(long, env = "DOCCRAWL_MAX_LINKS", default_value_t = 512)]
    pub max_links_per_page: usize,

    /// Maximum fetch tasks alive at once
    #[arg(long, env = "DOCCRAWL_MAX_IN_FLIGHT", default_value_t = 64)]
    pub max_in_flight: usize,
}

impl CrawlArgs {
    /// Converts the parsed flags into `CrawlControls`.
    pub fn build_controls(&self) -> CrawlControls {
        CrawlControls::new(self.domains_vec())
            .with_parallelism(self.parallelism)
            .with_politeness_delay(Duration::from_millis(self.delay_ms))
            .with_max_depth(self.max_depth)
            .with_max_links_per_page(self.max_links_per_page)
            .with_max_in_flight(self.max_in_flight)
    }

    fn domains_vec(&self) -> Vec<String> {
        self.allowed_domains
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
