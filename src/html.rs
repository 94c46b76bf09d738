//! Response body reading and `lol_html` link collection.

use futures_util::StreamExt;
use lol_html::{element, HtmlRewriter, OutputSink, Settings};
use reqwest::Response;
use std::cell::RefCell;
use std::rc::Rc;

/// Errors surfaced while reading or scanning HTML.
#[derive(Debug, thiserror::Error)]
pub enum HtmlStreamError {
    /// Reading the response stream failed.
    #[error("http stream error: {0}")]
    Http(#[from] reqwest::Error),
    /// The body exceeded the configured cap.
    #[error("body exceeds {limit} bytes")]
    TooLarge {
        /// Configured cap in bytes.
        limit: usize,
    },
    /// The HTML rewriter encountered malformed markup.
    #[error("html rewrite error: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
}

/// Streams a response body into memory, failing once it grows past `limit` bytes.
pub async fn read_body(response: Response, limit: usize) -> Result<Vec<u8>, HtmlStreamError> {
    if response
        .content_length()
        .is_some_and(|declared| declared > limit as u64)
    {
        return Err(HtmlStreamError::TooLarge { limit });
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > limit {
            return Err(HtmlStreamError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Scans anchor tags in `body`, transforming matching `href` values with `transform`.
///
/// The `transform` closure runs for every `href`; returning `Some(T)` keeps the value, `None` skips
/// it. Only accepted entries count against `limit`.
pub fn collect_links<T, F>(body: &[u8], limit: usize, transform: F) -> Result<Vec<T>, HtmlStreamError>
where
    F: Fn(&str) -> Option<T>,
{
    if limit == 0 {
        return Ok(Vec::new());
    }

    let values: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
    let values_handle = Rc::clone(&values);

    {
        let handler = element!("a[href]", |el| {
            let mut entries = values_handle.borrow_mut();
            if entries.len() >= limit {
                return Ok(());
            }
            if let Some(href) = el.get_attribute("href") {
                if let Some(mapped) = transform(&href) {
                    entries.push(mapped);
                }
            }
            Ok(())
        });

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![handler],
                ..Settings::default()
            },
            NoopSink,
        );
        rewriter.write(body)?;
        rewriter.end()?;
    }

    Ok(values.take())
}

struct NoopSink;

impl OutputSink for NoopSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}
