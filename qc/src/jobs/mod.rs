//! Request builders for the dispatcher
//!
//! Turn product rows into JSONL request files: one embedding request or one
//! query-generation chat request per product, each carrying the product id
//! as metadata so results can be joined back without relying on order.

mod embedding;
mod products;
mod query;

pub use embedding::create_embedding_jobs;
pub use products::{Product, field_text, load_products, product_id, save_jsonl};
pub use query::{DEFAULT_QUERY_MAX_TOKENS, QueryResponse, create_query_jobs, response_format};
