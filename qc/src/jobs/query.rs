//! Query-generation request creation

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::products::{Product, field_text, product_id};
use crate::prompts::PromptLoader;

/// Completion budget for one generated query pair
pub const DEFAULT_QUERY_MAX_TOKENS: u64 = 256;

/// Structured answer the model is asked to return
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub reasoning: String,
    pub short_query: String,
    pub long_query: String,
}

/// `response_format` constraining the answer to [`QueryResponse`]
pub fn response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "query_response",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "reasoning": {"type": "string"},
                    "short_query": {"type": "string"},
                    "long_query": {"type": "string"},
                },
                "required": ["reasoning", "short_query", "long_query"],
                "additionalProperties": false,
            },
        },
    })
}

/// Build one chat-completions request per product
///
/// The system prompt comes from the `query` template; products whose
/// `category_key` starts with "Books" get the book-title guidance. The user
/// message is the product's `text_keys` fields, one per line.
pub fn create_query_jobs(
    loader: &PromptLoader,
    products: &[Product],
    model: &str,
    text_keys: &[String],
    id_key: &str,
    category_key: &str,
    max_tokens: u64,
) -> Result<Vec<Value>> {
    debug!(count = products.len(), %model, ?text_keys, %id_key, %category_key, "create_query_jobs: called");

    let general_prompt = loader.query_prompt(None)?;
    let books_prompt = loader.query_prompt(Some("Books"))?;

    let mut jobs = Vec::with_capacity(products.len());
    for (row, product) in products.iter().enumerate() {
        let Some(id) = product_id(product, id_key) else {
            warn!(row, %id_key, "create_query_jobs: product has no id, skipping");
            continue;
        };
        let text = text_keys
            .iter()
            .filter_map(|key| field_text(product, key).map(|value| format!("{}: {}", key, value)))
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            warn!(row, %id, "create_query_jobs: product has no text, skipping");
            continue;
        }

        let category = category_text(product, category_key);
        let system = if category.as_deref().is_some_and(|c| c.starts_with("Books")) {
            &books_prompt
        } else {
            &general_prompt
        };

        jobs.push(json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text},
            ],
            "response_format": response_format(),
            "max_tokens": max_tokens,
            "metadata": { id_key: id },
        }));
    }

    info!("Created {} query jobs from {} products", jobs.len(), products.len());
    Ok(jobs)
}

/// Category path; list-valued categories are joined with " > "
fn category_text(product: &Product, key: &str) -> Option<String> {
    match product.get(key)? {
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(" > "))
        }
        _ => field_text(product, key),
    }
}
