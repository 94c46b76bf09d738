//! Index mapping used when creating or resetting the search index.

use super::IndexError;
use serde_json::{json, Value};

/// Built-in mapping: URL as a keyword id, text fields analyzed, timestamp as a date.
pub fn default_schema() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "properties": {
                "url": { "type": "keyword" },
                "title": { "type": "text" },
                "content": { "type": "text" },
                "code_snippets": { "type": "text" },
                "crawled_at": { "type": "date" }
            }
        }
    })
}

/// Parses a schema override, which must be a JSON object.
pub fn parse_schema(raw: &str) -> Result<Value, IndexError> {
    let schema: Value = serde_json::from_str(raw)?;
    if !schema.is_object() {
        return Err(IndexError::Config(
            "index schema must be a JSON object".to_string(),
        ));
    }
    Ok(schema)
}
