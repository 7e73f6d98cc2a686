//! API error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during a single API call
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The task running the call panicked or was cancelled
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

impl ApiError {
    /// Check if this is a rate limit rejection from the remote side
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. })
    }

    /// Check if this error is worth another attempt
    ///
    /// The dispatcher spends an attempt on every failure regardless. Failures
    /// that are not retryable are counted separately in `DispatchStats`.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::ApiError { status, .. } => *status >= 500 || *status == 408,
            ApiError::Network(_) => true,
            ApiError::Timeout(_) => true,
            ApiError::InvalidResponse(_) => false,
            ApiError::Json(_) => false,
            ApiError::WorkerFailed(_) => false,
        }
    }

    /// Get the server-suggested pause if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
