//! ApiClient trait definition

use async_trait::async_trait;
use serde_json::Value;

use super::ApiError;

/// Stateless API client - each call is one independent HTTP request
///
/// The payload is passed through untouched; the dispatcher never inspects
/// the request body beyond cost estimation.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Send a single request and return the decoded response body
    async fn send(&self, payload: &Value) -> Result<Value, ApiError>;
}
