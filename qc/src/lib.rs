//! querycurate - search-query curation for e-commerce catalogs
//!
//! Builds training data for product search: asks a language model to write
//! shopper-style queries for each product, embeds product text, and finds
//! each product's nearest neighbors. Every remote call goes through the
//! throttled [`dispatcher`], which keeps many requests in flight while
//! staying under a model's requests-per-minute and tokens-per-minute limits.
//!
//! # Modules
//!
//! - [`dispatcher`] - Capacity-budgeted job dispatch with retries
//! - [`llm`] - API client trait and OpenAI implementation
//! - [`jobs`] - Request builders for embeddings and query generation
//! - [`results`] - Extraction of embeddings and query pairs from results
//! - [`neighbors`] - Exact nearest-neighbor search over embeddings
//! - [`prompts`] - Prompt templates
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod jobs;
pub mod llm;
pub mod neighbors;
pub mod prompts;
pub mod results;

// Re-export commonly used types
pub use config::Config;
pub use dispatcher::{
    CostEstimator, DispatchError, DispatchStats, Dispatcher, DispatcherConfig, Job, JobResult, JsonlSink, Outcome,
    ResultSink, TokenCostEstimator,
};
pub use llm::{ApiClient, ApiError, OpenAiClient};
