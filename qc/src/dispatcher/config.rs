//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::DispatchError;

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Request-count ceiling per 60-second window
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u64,

    /// Token-count ceiling per 60-second window
    #[serde(default = "default_max_tokens_per_minute")]
    pub max_tokens_per_minute: u64,

    /// Attempts per job, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Backpressure sleep when capacity is exhausted
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Admission pause after a remote rate-limit rejection that carries no retry-after
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
}

fn default_max_requests_per_minute() -> u64 {
    1_500
}

fn default_max_tokens_per_minute() -> u64 {
    125_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_idle_sleep_ms() -> u64 {
    10
}

fn default_rate_limit_cooldown_secs() -> u64 {
    15
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            max_tokens_per_minute: default_max_tokens_per_minute(),
            max_attempts: default_max_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
        }
    }
}

impl DispatcherConfig {
    /// Reject settings that would make the dispatcher stall or never run a job
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_requests_per_minute == 0 {
            return Err(DispatchError::Config("max_requests_per_minute must be positive".to_string()));
        }
        if self.max_tokens_per_minute == 0 {
            return Err(DispatchError::Config("max_tokens_per_minute must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(DispatchError::Config("max_attempts must be positive".to_string()));
        }
        if self.idle_sleep_ms == 0 {
            return Err(DispatchError::Config("idle_sleep_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}
