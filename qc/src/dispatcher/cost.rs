//! Token cost estimation
//!
//! Costs are counted with the same BPE encoding the API bills against.
//! Chat requests also reserve room for the completion (`n * max_tokens`).

use eyre::{Result, eyre};
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Default context ceiling for embedding models
pub const DEFAULT_CONTEXT_TOKENS: usize = 8191;

/// Completion budget assumed when a request does not set `max_tokens`
const DEFAULT_MAX_TOKENS: u64 = 15;

/// Computes the token cost of a job before it is admitted
pub trait CostEstimator: Send + Sync {
    /// Truncate oversized input in place, then return the job's token cost
    fn estimate(&self, payload: &mut Value) -> u64;
}

/// Which API a request targets; decides how its tokens are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Embeddings,
    ChatCompletions,
    Completions,
}

impl Endpoint {
    /// Infer the endpoint from a request URL
    pub fn from_url(url: &str) -> Option<Self> {
        debug!(%url, "Endpoint::from_url: called");
        let path = url.trim_end_matches('/');
        if path.ends_with("/embeddings") || path == "embeddings" {
            Some(Self::Embeddings)
        } else if path.ends_with("chat/completions") {
            Some(Self::ChatCompletions)
        } else if path.ends_with("completions") {
            Some(Self::Completions)
        } else {
            None
        }
    }
}

/// Load a BPE encoding by its tiktoken name
pub fn load_encoding(name: &str) -> Result<CoreBPE> {
    debug!(%name, "load_encoding: called");
    let bpe = match name {
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "o200k_base" => tiktoken_rs::o200k_base(),
        "p50k_base" => tiktoken_rs::p50k_base(),
        "p50k_edit" => tiktoken_rs::p50k_edit(),
        "r50k_base" => tiktoken_rs::r50k_base(),
        other => return Err(eyre!("Unknown token encoding: '{}'", other)),
    };
    bpe.map_err(|e| eyre!("Failed to load token encoding '{}': {}", name, e))
}

/// Cost estimator backed by a tiktoken encoding
pub struct TokenCostEstimator {
    bpe: CoreBPE,
    endpoint: Endpoint,
    context_tokens: usize,
}

impl TokenCostEstimator {
    pub fn new(encoding: &str, endpoint: Endpoint, context_tokens: usize) -> Result<Self> {
        debug!(%encoding, ?endpoint, %context_tokens, "TokenCostEstimator::new: called");
        Ok(Self {
            bpe: load_encoding(encoding)?,
            endpoint,
            context_tokens,
        })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Drop trailing tokens so `text` fits the context ceiling
    ///
    /// When the cut lands inside a multi-token character, further tokens are
    /// dropped until the prefix decodes cleanly.
    pub fn truncate(&self, text: &str) -> String {
        let tokens = self.bpe.encode_ordinary(text);
        if tokens.len() <= self.context_tokens {
            return text.to_string();
        }

        debug!(tokens = tokens.len(), limit = self.context_tokens, "TokenCostEstimator::truncate: truncating");
        let mut end = self.context_tokens;
        while end > 0 {
            if let Ok(prefix) = self.bpe.decode(tokens[..end].to_vec()) {
                return prefix;
            }
            end -= 1;
        }
        warn!("TokenCostEstimator::truncate: no decodable prefix, dropping input");
        String::new()
    }

    fn truncate_in_place(&self, value: &mut Value) {
        if let Value::String(text) = value {
            let truncated = self.truncate(text);
            if truncated.len() != text.len() {
                *text = truncated;
            }
        }
    }

    fn count_value(&self, value: &Value) -> u64 {
        match value {
            Value::String(text) => self.count(text) as u64,
            Value::Null => 0,
            other => self.count(&other.to_string()) as u64,
        }
    }

    fn completion_budget(payload: &Value) -> u64 {
        let max_tokens = payload
            .get("max_tokens")
            .or_else(|| payload.get("max_completion_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let n = payload.get("n").and_then(Value::as_u64).unwrap_or(1);
        n * max_tokens
    }

    fn estimate_embeddings(&self, payload: &mut Value) -> u64 {
        let Some(input) = payload.get_mut("input") else {
            return 0;
        };
        match input {
            Value::Array(items) => items
                .iter_mut()
                .map(|item| {
                    self.truncate_in_place(item);
                    self.count_value(item)
                })
                .sum(),
            other => {
                self.truncate_in_place(other);
                self.count_value(other)
            }
        }
    }

    fn estimate_chat(&self, payload: &mut Value) -> u64 {
        let completion = Self::completion_budget(payload);
        let mut prompt = 0u64;

        if let Some(Value::Array(messages)) = payload.get_mut("messages") {
            for message in messages.iter_mut() {
                prompt += 4;
                if let Value::Object(fields) = message {
                    if let Some(content) = fields.get_mut("content") {
                        self.truncate_in_place(content);
                    }
                    for (key, value) in fields.iter() {
                        prompt += self.count_value(value);
                        if key == "name" {
                            prompt = prompt.saturating_sub(1);
                        }
                    }
                }
            }
            prompt += 2;
        }

        prompt + completion
    }

    fn estimate_completions(&self, payload: &mut Value) -> u64 {
        let completion = Self::completion_budget(payload);
        let prompt = match payload.get_mut("prompt") {
            Some(Value::Array(prompts)) => {
                let count = prompts.len() as u64;
                let tokens: u64 = prompts
                    .iter_mut()
                    .map(|p| {
                        self.truncate_in_place(p);
                        self.count_value(p)
                    })
                    .sum();
                return tokens + completion * count;
            }
            Some(other) => {
                self.truncate_in_place(other);
                self.count_value(other)
            }
            None => 0,
        };
        prompt + completion
    }
}

impl CostEstimator for TokenCostEstimator {
    fn estimate(&self, payload: &mut Value) -> u64 {
        match self.endpoint {
            Endpoint::Embeddings => self.estimate_embeddings(payload),
            Endpoint::ChatCompletions => self.estimate_chat(payload),
            Endpoint::Completions => self.estimate_completions(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn estimator(endpoint: Endpoint, context_tokens: usize) -> TokenCostEstimator {
        TokenCostEstimator::new("cl100k_base", endpoint, context_tokens).unwrap()
    }

    #[test]
    fn test_endpoint_from_url() {
        assert_eq!(
            Endpoint::from_url("https://api.openai.com/v1/embeddings"),
            Some(Endpoint::Embeddings)
        );
        assert_eq!(
            Endpoint::from_url("https://api.openai.com/v1/chat/completions"),
            Some(Endpoint::ChatCompletions)
        );
        assert_eq!(
            Endpoint::from_url("https://api.openai.com/v1/completions/"),
            Some(Endpoint::Completions)
        );
        assert_eq!(Endpoint::from_url("https://api.openai.com/v1/files"), None);
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(load_encoding("nope_base").is_err());
    }

    #[test]
    fn test_embedding_cost_is_token_count() {
        let est = estimator(Endpoint::Embeddings, DEFAULT_CONTEXT_TOKENS);
        let text = "Waterproof hiking boots for women";
        let mut payload = json!({"model": "text-embedding-3-small", "input": text});
        assert_eq!(est.estimate(&mut payload), est.count(text) as u64);
    }

    #[test]
    fn test_embedding_list_input_sums() {
        let est = estimator(Endpoint::Embeddings, DEFAULT_CONTEXT_TOKENS);
        let mut payload = json!({"input": ["red mug", "blue mug"]});
        let expected = est.count("red mug") + est.count("blue mug");
        assert_eq!(est.estimate(&mut payload), expected as u64);
    }

    #[test]
    fn test_oversized_input_is_truncated_not_rejected() {
        let est = estimator(Endpoint::Embeddings, 16);
        let long = "stainless steel water bottle ".repeat(50);
        let mut payload = json!({"input": long});

        let cost = est.estimate(&mut payload);
        assert!(cost <= 16);
        assert!(cost > 0);

        let truncated = payload["input"].as_str().unwrap();
        assert!(long.starts_with(truncated));
        assert!(truncated.len() < long.len());
    }

    #[test]
    fn test_truncate_is_deterministic() {
        let est = estimator(Endpoint::Embeddings, 8);
        let text = "lightweight carbon fiber tripod with ball head and carry bag";
        assert_eq!(est.truncate(text), est.truncate(text));
        assert_eq!(est.truncate("short"), "short");
    }

    #[test]
    fn test_chat_cost_includes_completion_budget() {
        let est = estimator(Endpoint::ChatCompletions, DEFAULT_CONTEXT_TOKENS);
        let mut payload = json!({
            "model": "gpt-4o-mini",
            "max_tokens": 100,
            "messages": [
                {"role": "system", "content": "Generate queries."},
                {"role": "user", "content": "Ceramic coffee mug"},
            ]
        });

        let prompt = 4 + est.count("system") + est.count("Generate queries.")
            + 4 + est.count("user") + est.count("Ceramic coffee mug")
            + 2;
        assert_eq!(est.estimate(&mut payload), (prompt + 100) as u64);
    }

    #[test]
    fn test_chat_default_completion_budget() {
        let est = estimator(Endpoint::ChatCompletions, DEFAULT_CONTEXT_TOKENS);
        let mut payload = json!({"n": 2, "messages": []});
        // 2 priming tokens plus n * 15
        assert_eq!(est.estimate(&mut payload), 2 + 30);
    }

    #[test]
    fn test_missing_input_costs_nothing() {
        let est = estimator(Endpoint::Embeddings, DEFAULT_CONTEXT_TOKENS);
        let mut payload = json!({"model": "text-embedding-3-small"});
        assert_eq!(est.estimate(&mut payload), 0);
    }
}
