//! Throttled dispatcher for rate-limited API calls
//!
//! Keeps many requests in flight while respecting a requests-per-minute and
//! a tokens-per-minute ceiling, retries failures through a priority retry
//! queue and writes exactly one result record per job.

mod capacity;
mod config;
mod core;
mod cost;
mod error;
mod job;
mod queue;
mod sink;
mod stats;
mod worker;

pub use capacity::{CapacityBudget, CapacityTracker, RATE_WINDOW};
pub use config::DispatcherConfig;
pub use self::core::Dispatcher;
pub use cost::{CostEstimator, DEFAULT_CONTEXT_TOKENS, Endpoint, TokenCostEstimator, load_encoding};
pub use error::DispatchError;
pub use job::{Job, JobResult, Outcome, read_jobs};
pub use queue::{JobSource, RetryQueue};
pub use sink::{JsonlSink, ResultSink};
pub use stats::DispatchStats;
