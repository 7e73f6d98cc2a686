//! Execution worker: one network call per admitted job

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{ApiClient, ApiError};

/// Perform exactly one call for job `job_id` and return what happened
///
/// Never retries; the loop decides what happens to a failed job. The loop
/// keeps the job itself, so a worker that panics still leaves it routable.
pub async fn execute(
    job_id: u64,
    payload: Value,
    client: Arc<dyn ApiClient>,
    timeout: Duration,
) -> Result<Value, ApiError> {
    debug!(job_id, "execute: called");

    match tokio::time::timeout(timeout, client.send(&payload)).await {
        Ok(Ok(response)) => {
            debug!(job_id, "execute: success");
            Ok(response)
        }
        Ok(Err(error)) => {
            warn!(job_id, %error, "Request failed");
            Err(error)
        }
        Err(_) => {
            warn!(job_id, ?timeout, "Request timed out");
            Err(ApiError::Timeout(timeout))
        }
    }
}
