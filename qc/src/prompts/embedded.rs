//! Embedded prompts
//!
//! These are compiled into the binary from .pmt files at build time.

use tracing::debug;

/// Query-generation system prompt
pub const QUERY_GENERATION: &str = include_str!("../../prompts/query.pmt");

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "query" => {
            debug!("get_embedded: matched query");
            Some(QUERY_GENERATION)
        }
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_embedded_query() {
        let prompt = get_embedded("query").unwrap();
        assert!(prompt.contains("short_query"));
        assert!(prompt.contains("long_query"));
        assert!(prompt.contains("reasoning"));
        assert!(prompt.contains("1-3 words"));
    }

    #[test]
    fn test_get_embedded_unknown() {
        assert!(get_embedded("unknown-template").is_none());
    }
}
