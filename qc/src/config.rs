//! Configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

use crate::dispatcher::{DEFAULT_CONTEXT_TOKENS, DispatcherConfig, Endpoint};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OpenAI endpoints, credentials and per-model limits
    pub openai: OpenAiConfig,

    /// Dispatcher loop tuning
    pub dispatcher: DispatchTuning,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks that the API key environment variable is set. Call this after
    /// loading `.env` and before any request is built.
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.openai.api_key_env).map(|k| k.trim().is_empty()).unwrap_or(true) {
            return Err(eyre!(
                "OpenAI API key not found. Set the {} environment variable.",
                self.openai.api_key_env
            ));
        }
        if !(self.openai.scale_factor > 0.0 && self.openai.scale_factor <= 1.0) {
            return Err(eyre!(
                "scale-factor must be in (0, 1], got {}",
                self.openai.scale_factor
            ));
        }
        Ok(())
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.openai.api_key_env)
            .context(format!("Environment variable {} is not set", self.openai.api_key_env))
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .querycurate.yml
        let local_config = PathBuf::from(".querycurate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/querycurate/querycurate.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("querycurate").join("querycurate.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Limits for a model, or an error naming the known models
    pub fn model_limits(&self, model: &str) -> Result<&ModelLimits> {
        self.openai.models.get(model).ok_or_else(|| {
            let known: Vec<&str> = self.openai.models.keys().map(String::as_str).collect();
            eyre!("No limits configured for model '{}'. Known: {}", model, known.join(", "))
        })
    }

    /// Dispatcher settings for a model, with its published limits scaled down
    pub fn dispatcher_config(&self, model: &str) -> Result<DispatcherConfig> {
        let limits = self.model_limits(model)?;
        let scale = |limit: u64| ((limit as f64 * self.openai.scale_factor) as u64).max(1);

        Ok(DispatcherConfig {
            max_requests_per_minute: scale(limits.requests_per_minute),
            max_tokens_per_minute: scale(limits.tokens_per_minute),
            max_attempts: self.openai.max_attempts,
            request_timeout_ms: self.openai.timeout_ms,
            idle_sleep_ms: self.dispatcher.idle_sleep_ms,
            rate_limit_cooldown_secs: self.dispatcher.rate_limit_cooldown_secs,
        })
    }
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Endpoint URLs
    pub url: UrlConfig,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Attempts per request before it is written as a failure
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Per-request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Fraction of the published rate limits to use
    #[serde(rename = "scale-factor")]
    pub scale_factor: f64,

    /// Per-model rate limits and encodings
    pub models: BTreeMap<String, ModelLimits>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        let models = [
            ("gpt-4o", 5_000, 450_000, "o200k_base"),
            ("gpt-4o-mini", 5_000, 2_000_000, "o200k_base"),
            ("gpt-3.5-turbo", 3_500, 2_000_000, "cl100k_base"),
            ("text-embedding-3-large", 5_000, 5_000_000, "cl100k_base"),
            ("text-embedding-3-small", 5_000, 5_000_000, "cl100k_base"),
            ("text-embedding-ada-002", 5_000, 5_000_000, "cl100k_base"),
        ]
        .into_iter()
        .map(|(name, rpm, tpm, encoding)| {
            (
                name.to_string(),
                ModelLimits {
                    requests_per_minute: rpm,
                    tokens_per_minute: tpm,
                    token_encoding: encoding.to_string(),
                    context_tokens: DEFAULT_CONTEXT_TOKENS,
                },
            )
        })
        .collect();

        Self {
            url: UrlConfig::default(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_attempts: 5,
            timeout_ms: 60_000,
            scale_factor: 0.8,
            models,
        }
    }
}

impl OpenAiConfig {
    pub fn url_for(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Embeddings => &self.url.embedding,
            Endpoint::ChatCompletions | Endpoint::Completions => &self.url.chat,
        }
    }
}

/// Endpoint URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlConfig {
    pub embedding: String,
    pub chat: String,
}

impl Default for UrlConfig {
    fn default() -> Self {
        Self {
            embedding: "https://api.openai.com/v1/embeddings".to_string(),
            chat: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }
}

/// Published limits for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    #[serde(rename = "requests-per-minute")]
    pub requests_per_minute: u64,

    #[serde(rename = "tokens-per-minute")]
    pub tokens_per_minute: u64,

    /// tiktoken encoding name
    #[serde(rename = "token-encoding", default = "default_token_encoding")]
    pub token_encoding: String,

    /// Input longer than this many tokens is truncated
    #[serde(rename = "context-tokens", default = "default_context_tokens")]
    pub context_tokens: usize,
}

fn default_token_encoding() -> String {
    "cl100k_base".to_string()
}

fn default_context_tokens() -> usize {
    DEFAULT_CONTEXT_TOKENS
}

/// Dispatcher loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchTuning {
    /// Sleep between admission attempts when capacity is exhausted
    #[serde(rename = "idle-sleep-ms")]
    pub idle_sleep_ms: u64,

    /// Admission pause after a remote rate-limit rejection
    #[serde(rename = "rate-limit-cooldown-secs")]
    pub rate_limit_cooldown_secs: u64,
}

impl Default for DispatchTuning {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 10,
            rate_limit_cooldown_secs: 15,
        }
    }
}
