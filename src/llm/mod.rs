//! LLM integration.
//!
//! A single `LlmProvider` trait with an OpenAI-compatible HTTP implementation.
//! Content generation depends only on the trait, so tests swap in canned
//! providers.

pub mod openai_compatible;
pub mod provider;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatibleProvider::new(config.clone())?;
    tracing::info!("Using OpenAI-compatible endpoint {} (model: {})", config.base_url, config.model);
    Ok(Arc::new(provider))
}
