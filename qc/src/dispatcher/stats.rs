//! Run statistics for the dispatcher

use tracing::{info, warn};

use crate::llm::ApiError;

/// Counters for one dispatch run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    /// Admissions, including re-admissions of retried jobs
    pub total_started: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    /// Failed attempts that went back to the retry queue
    pub total_retried: u64,
    pub rate_limit_errors: u64,
    pub api_errors: u64,
    pub other_errors: u64,
    /// Failed attempts whose error says another try is unlikely to help
    pub non_retryable_errors: u64,
    pub peak_in_flight: usize,
}

impl DispatchStats {
    pub fn record_error(&mut self, error: &ApiError) {
        match error {
            ApiError::RateLimited { .. } => self.rate_limit_errors += 1,
            ApiError::ApiError { .. } => self.api_errors += 1,
            _ => self.other_errors += 1,
        }
        if !error.is_retryable() {
            self.non_retryable_errors += 1;
        }
    }

    /// Jobs that reached a terminal result
    pub fn total_completed(&self) -> u64 {
        self.total_succeeded + self.total_failed
    }

    /// Log the end-of-run summary
    pub fn log_summary(&self) {
        info!(
            started = self.total_started,
            succeeded = self.total_succeeded,
            failed = self.total_failed,
            retried = self.total_retried,
            non_retryable_errors = self.non_retryable_errors,
            peak_in_flight = self.peak_in_flight,
            "Parallel processing complete"
        );
        if self.total_failed > 0 {
            warn!(
                "{} / {} requests failed; failure records are in the results file",
                self.total_failed,
                self.total_completed()
            );
        }
        if self.rate_limit_errors > 0 {
            warn!(
                "{} rate limit errors received; consider running at a lower rate",
                self.rate_limit_errors
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_error_buckets() {
        let mut stats = DispatchStats::default();
        stats.record_error(&ApiError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        });
        stats.record_error(&ApiError::ApiError {
            status: 500,
            message: "oops".to_string(),
        });
        stats.record_error(&ApiError::Timeout(Duration::from_secs(1)));
        stats.record_error(&ApiError::InvalidResponse("bad".to_string()));

        assert_eq!(stats.rate_limit_errors, 1);
        assert_eq!(stats.api_errors, 1);
        assert_eq!(stats.other_errors, 2);
        // Only the malformed response is not worth another try
        assert_eq!(stats.non_retryable_errors, 1);
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let mut stats = DispatchStats::default();
        stats.record_error(&ApiError::ApiError {
            status: 400,
            message: "bad request".to_string(),
        });
        stats.record_error(&ApiError::ApiError {
            status: 503,
            message: "unavailable".to_string(),
        });
        stats.record_error(&ApiError::WorkerFailed("panicked".to_string()));

        assert_eq!(stats.api_errors, 2);
        assert_eq!(stats.other_errors, 1);
        assert_eq!(stats.non_retryable_errors, 2);
    }

    #[test]
    fn test_total_completed() {
        let stats = DispatchStats {
            total_succeeded: 3,
            total_failed: 2,
            ..Default::default()
        };
        assert_eq!(stats.total_completed(), 5);
    }
}
