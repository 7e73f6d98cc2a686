//! Embedding request creation

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::products::{Product, field_text, product_id};
use crate::dispatcher::TokenCostEstimator;

/// Separator between product fields in the embedded text
const FIELD_SEPARATOR: &str = "\n\n";

/// Build one embeddings request per product
///
/// The input is the product's `product_keys` fields joined by a blank line
/// and truncated to the encoder's context ceiling. Products without an id
/// or without any text are skipped.
pub fn create_embedding_jobs(
    products: &[Product],
    model: &str,
    product_keys: &[String],
    id_key: &str,
    encoder: &TokenCostEstimator,
) -> Vec<Value> {
    debug!(count = products.len(), %model, ?product_keys, %id_key, "create_embedding_jobs: called");

    let mut jobs = Vec::with_capacity(products.len());
    for (row, product) in products.iter().enumerate() {
        let Some(id) = product_id(product, id_key) else {
            warn!(row, %id_key, "create_embedding_jobs: product has no id, skipping");
            continue;
        };
        let text = product_keys
            .iter()
            .filter_map(|key| field_text(product, key))
            .collect::<Vec<_>>()
            .join(FIELD_SEPARATOR);
        if text.is_empty() {
            warn!(row, %id, "create_embedding_jobs: product has no text, skipping");
            continue;
        }

        jobs.push(json!({
            "model": model,
            "input": encoder.truncate(&text),
            "metadata": { id_key: id },
        }));
    }

    info!("Created {} embedding jobs from {} products", jobs.len(), products.len());
    jobs
}
