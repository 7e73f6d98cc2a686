//! Remote API client module
//!
//! Provides the client seam the dispatcher drives, plus the OpenAI
//! implementation used by the CLI.

pub mod client;
mod error;
mod openai;

pub use client::ApiClient;
pub use error::ApiError;
pub use openai::OpenAiClient;
