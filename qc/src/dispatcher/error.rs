//! Dispatcher error types

use thiserror::Error;

/// Errors that stop a dispatch run
///
/// Individual job failures are never reported here; they become failure
/// records in the result sink.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid dispatcher configuration: {0}")]
    Config(String),

    #[error("Failed to write result record: {0}")]
    Sink(#[from] std::io::Error),

    #[error("Failed to encode result record: {0}")]
    Encode(#[from] serde_json::Error),
}
