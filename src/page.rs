//! Page records shared by the extractor, the canonical store, and the search index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Language tag attached to every code section. Detection is not performed.
pub const CODE_LANGUAGE_PLACEHOLDER: &str = "detected";

/// Classification for extracted sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Preformatted snippet, usually source code.
    Code,
    /// Prose, including markdown-style headings.
    Text,
}

impl SectionKind {
    /// Column value stored in `sections.section_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored `section_type` value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown section kind `{0}`")]
pub struct UnknownSectionKind(pub String);

impl FromStr for SectionKind {
    type Err = UnknownSectionKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "code" => Ok(Self::Code),
            "text" => Ok(Self::Text),
            other => Err(UnknownSectionKind(other.to_string())),
        }
    }
}

/// One ordered block of page content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Code or text.
    pub kind: SectionKind,
    /// Trimmed, non-empty content.
    pub content: String,
    /// Language tag; only code sections carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Section {
    /// Builds a code section tagged with [`CODE_LANGUAGE_PLACEHOLDER`].
    pub fn code(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Code,
            content: content.into(),
            language: Some(CODE_LANGUAGE_PLACEHOLDER.to_string()),
        }
    }

    /// Builds a plain text section.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Text,
            content: content.into(),
            language: None,
        }
    }

    /// True when the section has no visible content.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Structured content extracted from one documentation page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Absolute URL; unique key in the canonical store.
    pub url: String,
    /// Resolved page title.
    pub title: String,
    /// Sections in document order.
    pub sections: Vec<Section>,
    /// When the page was fetched.
    pub crawled_at: DateTime<Utc>,
}

/// Reasons a page cannot be persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPage {
    /// The URL was empty.
    #[error("page url is empty")]
    EmptyUrl,
    /// The page carried no sections.
    #[error("page {0} has no sections")]
    NoSections(String),
    /// A section was empty after trimming.
    #[error("page {url} has a blank section at position {position}")]
    BlankSection {
        /// Offending page.
        url: String,
        /// Index of the blank section.
        position: usize,
    },
}

impl Page {
    /// Checks the invariants required before a page reaches storage.
    pub fn validate(&self) -> Result<(), InvalidPage> {
        if self.url.trim().is_empty() {
            return Err(InvalidPage::EmptyUrl);
        }
        if self.sections.is_empty() {
            return Err(InvalidPage::NoSections(self.url.clone()));
        }
        if let Some(position) = self.sections.iter().position(Section::is_blank) {
            return Err(InvalidPage::BlankSection {
                url: self.url.clone(),
                position,
            });
        }
        Ok(())
    }

    /// Content of the first section, used as a result preview.
    pub fn preview(&self) -> &str {
        self.sections
            .first()
            .map(|section| section.content.as_str())
            .unwrap_or_default()
    }
}

/// Search index projection of a [`Page`], keyed by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Document id and page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Text sections joined by newlines.
    pub content: String,
    /// Code sections joined by newlines.
    pub code_snippets: String,
    /// Crawl timestamp carried over from the page.
    pub crawled_at: DateTime<Utc>,
}

impl IndexDocument {
    /// Derives the index document for `page`.
    pub fn from_page(page: &Page) -> Self {
        let mut content = String::new();
        let mut code_snippets = String::new();
        for section in &page.sections {
            let target = match section.kind {
                SectionKind::Code => &mut code_snippets,
                SectionKind::Text => &mut content,
            };
            target.push_str(&section.content);
            target.push('\n');
        }
        Self {
            url: page.url.clone(),
            title: page.title.clone(),
            content,
            code_snippets,
            crawled_at: page.crawled_at,
        }
    }

    /// Preview text for a search hit: the first text section, else all code.
    ///
    /// Text sections are single-line after extraction, so the first line of
    /// `content` is the first text section. The document keeps text and code
    /// in separate fields and loses their relative order, so this differs from
    /// [`Page::preview`] when a page opens with a code block: a page of
    /// `[code "x=1", text "hello"]` previews as `"hello"` here. Pages with no
    /// text return the trimmed code content whole.
    pub fn preview(&self) -> &str {
        let first_text = self
            .content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty());
        match first_text {
            Some(line) => line,
            None => self.code_snippets.trim(),
        }
    }

    /// Approximate serialized size, used for bulk flush thresholds.
    pub fn estimated_bytes(&self) -> usize {
        self.url.len()
            + self.title.len()
            + self.content.len()
            + self.code_snippets.len()
            + ESTIMATED_ENVELOPE_BYTES
    }
}

// Field names, quoting, timestamp, and the bulk action line.
const ESTIMATED_ENVELOPE_BYTES: usize = 160;
