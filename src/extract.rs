//! Turns fetched documentation HTML into structured [`Page`] records.

use crate::page::{Page, Section};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use std::borrow::Cow;
use url::Url;

/// Candidate content containers, matched anywhere in the document.
const CONTAINER_SELECTOR: &str = "article, main, div[role='main'], .documentation";
/// Elements that become sections, visited in document order.
const SECTION_SELECTOR: &str = "p, pre, h2, h3";

/// Raw page bytes plus crawl metadata awaiting extraction.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL the document was fetched from.
    pub url: Url,
    /// Crawl depth when the page was scheduled.
    pub depth: u8,
    /// Timestamp when the fetch completed.
    pub fetched_at: DateTime<Utc>,
    /// Raw response body bytes.
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Builds a new fetched page payload.
    pub fn new(url: Url, depth: u8, fetched_at: DateTime<Utc>, body: Vec<u8>) -> Self {
        Self {
            url,
            depth,
            fetched_at,
            body,
        }
    }
}

/// Errors surfaced while extracting a page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    /// The response body was empty.
    #[error("no body bytes available for extraction")]
    EmptyBody,
}

/// Pages built from one document.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Pages with at least one section, one per matching container.
    pub pages: Vec<Page>,
    /// Containers dropped because they produced no sections.
    pub discarded: usize,
    /// True when the body required lossy UTF-8 decoding.
    pub lossy_decoding: bool,
}

/// Stateless HTML extraction service.
#[derive(Clone)]
pub struct Extractor {
    selectors: Selectors,
}

impl Extractor {
    /// Builds a new extractor instance.
    pub fn new() -> Self {
        Self {
            selectors: Selectors::new(),
        }
    }

    /// Builds one page per content container found in `fetched`.
    pub fn extract(&self, fetched: &FetchedPage) -> Result<Extraction, ExtractError> {
        if fetched.body.is_empty() {
            return Err(ExtractError::EmptyBody);
        }

        let (decoded, lossy_decoding) = decode_body(&fetched.body);
        let document = Html::parse_document(&decoded);
        let document_title = self.document_title(&document);

        let mut extraction = Extraction {
            lossy_decoding,
            ..Extraction::default()
        };
        for container in document.select(&self.selectors.container) {
            let sections = self.collect_sections(container);
            if sections.is_empty() {
                extraction.discarded += 1;
                continue;
            }

            let heading = self.heading_text(container);
            let title = if heading.is_empty() {
                document_title.clone()
            } else {
                heading
            };

            extraction.pages.push(Page {
                url: fetched.url.to_string(),
                title,
                sections,
                crawled_at: fetched.fetched_at,
            });
        }
        Ok(extraction)
    }

    fn collect_sections(&self, container: ElementRef<'_>) -> Vec<Section> {
        let mut sections = Vec::new();
        for element in container.select(&self.selectors.section) {
            let section = match element.value().name() {
                "pre" => {
                    let code = trim_code(&raw_text(&element));
                    (!code.is_empty()).then(|| Section::code(code))
                }
                "h2" | "h3" => {
                    let heading = collapse_whitespace(&raw_text(&element));
                    (!heading.is_empty()).then(|| Section::text(format!("## {heading}")))
                }
                _ => {
                    let text = collapse_whitespace(&raw_text(&element));
                    (!text.is_empty()).then(|| Section::text(text))
                }
            };
            sections.extend(section);
        }
        sections
    }

    fn heading_text(&self, container: ElementRef<'_>) -> String {
        let joined = container
            .select(&self.selectors.heading)
            .map(|heading| raw_text(&heading))
            .collect::<Vec<_>>()
            .join(" ");
        collapse_whitespace(&joined)
    }

    fn document_title(&self, document: &Html) -> String {
        document
            .select(&self.selectors.title)
            .next()
            .map(|title| collapse_whitespace(&raw_text(&title)))
            .unwrap_or_default()
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct Selectors {
    container: Selector,
    section: Selector,
    heading: Selector,
    title: Selector,
}

impl Selectors {
    fn new() -> Self {
        Self {
            container: Selector::parse(CONTAINER_SELECTOR).expect("container selector"),
            section: Selector::parse(SECTION_SELECTOR).expect("section selector"),
            heading: Selector::parse("h1").expect("heading selector"),
            title: Selector::parse("title").expect("title selector"),
        }
    }
}

fn decode_body(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), false),
        Err(_) => (
            Cow::Owned(String::from_utf8_lossy(bytes).into_owned()),
            true,
        ),
    }
}

fn raw_text(element: &ElementRef<'_>) -> String {
    element.text().collect()
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim().to_string()
}

// Interior line breaks and indentation are significant in code.
fn trim_code(input: &str) -> String {
    let lines: Vec<&str> = input.lines().map(str::trim_end).collect();
    lines.join("\n").trim().to_string()
}
