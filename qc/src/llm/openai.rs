//! OpenAI API client implementation
//!
//! Implements the ApiClient trait for the OpenAI embeddings and chat
//! completions endpoints. Retries are not done here: every failure is
//! reported back to the dispatcher so retried work stays under budget.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{ApiClient, ApiError};

/// OpenAI API client bound to a single endpoint
pub struct OpenAiClient {
    request_url: String,
    api_key: String,
    http: Client,
    timeout: Duration,
}

impl OpenAiClient {
    /// Create a new client for the given endpoint URL
    pub fn new(request_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let request_url = request_url.into();
        debug!(%request_url, ?timeout, "OpenAiClient::new: called");

        let http = Client::builder().timeout(timeout).build().map_err(ApiError::Network)?;

        Ok(Self {
            request_url,
            api_key: api_key.into(),
            http,
            timeout,
        })
    }

    /// The endpoint this client posts to
    pub fn request_url(&self) -> &str {
        &self.request_url
    }
}

/// Turn an error response into an ApiError
///
/// OpenAI reports rate limiting either with a 429 or with an error body whose
/// message mentions the rate limit, so both are checked.
pub(crate) fn classify_error(status: u16, body: &Value, retry_after: Option<Duration>) -> ApiError {
    debug!(%status, "classify_error: called");
    let message = body
        .get("error")
        .and_then(|e| e.get("message").and_then(Value::as_str).map(str::to_string).or_else(|| e.as_str().map(str::to_string)))
        .unwrap_or_else(|| body.to_string());

    if status == 429 || message.contains("Rate limit") {
        debug!("classify_error: rate limit");
        return ApiError::RateLimited { message, retry_after };
    }

    ApiError::ApiError { status, message }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

#[async_trait]
impl ApiClient for OpenAiClient {
    async fn send(&self, payload: &Value) -> Result<Value, ApiError> {
        debug!(url = %self.request_url, "OpenAiClient::send: called");

        let response = self
            .http
            .post(&self.request_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout(self.timeout)
                } else {
                    ApiError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(self.timeout)
            } else {
                ApiError::Network(e)
            }
        })?;

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(e) if (200..300).contains(&status) => {
                debug!(%status, "OpenAiClient::send: success status with undecodable body");
                return Err(ApiError::Json(e));
            }
            Err(_) => Value::String(text),
        };

        if !(200..300).contains(&status) || body.get("error").is_some() {
            debug!(%status, "OpenAiClient::send: error response");
            return Err(classify_error(status, &body, retry_after));
        }

        debug!("OpenAiClient::send: success");
        Ok(body)
    }
}
