//! LLM provider abstraction.
//!
//! The engine treats the model as an external service with a narrow
//! contract: `generate(prompt, options) -> text`, failing with a
//! service error on timeout, quota, or malformed output. Providers are
//! swappable behind [`LlmProvider`]; the factory picks one from
//! configuration.

mod openai;
mod stub;

pub use openai::OpenAiLlmProvider;
pub use stub::StubLlmProvider;

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::{LlmConfig, LlmProviderType};
use crate::errors::{EngineError, EngineResult};

/// Per-call generation options.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl LlmOptions {
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmProviderInfo {
    pub name: String,
    pub model: String,
}

/// Abstract interface every provider implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate text from a prompt. One immediate retry on a transient
    /// failure is the provider's responsibility; anything further
    /// propagates as the containing operation's failure.
    async fn generate(&self, prompt: &str, options: &LlmOptions) -> EngineResult<String>;

    fn info(&self) -> LlmProviderInfo;
}

/// Factory for creating providers from configuration.
pub struct LlmProviderFactory;

impl LlmProviderFactory {
    pub fn create(config: &LlmConfig) -> EngineResult<Arc<dyn LlmProvider>> {
        match config.provider_type {
            LlmProviderType::Stub => Ok(Arc::new(StubLlmProvider::echo())),
            LlmProviderType::OpenAi => Ok(Arc::new(OpenAiLlmProvider::new(config.clone())?)),
            LlmProviderType::Local => {
                if config.base_url.is_none() {
                    return Err(EngineError::Config(
                        "local provider requires a base_url".to_string(),
                    ));
                }
                Ok(Arc::new(OpenAiLlmProvider::new(config.clone())?))
            }
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Strip markdown code fences the model may wrap its output in.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```sql"))
        .or_else(|| trimmed.strip_prefix("```"));
    match without_open {
        Some(rest) => rest.trim_start().strip_suffix("```").unwrap_or(rest).trim(),
        None => trimmed,
    }
}

/// Extract the first JSON object from a text blob and deserialize it.
/// Models often surround JSON with prose; take the outermost braces.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> EngineResult<T> {
    let cleaned = strip_code_fences(text);
    let (start, end) = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end + 1),
        _ => (0, cleaned.len()),
    };
    let content = &cleaned[start..end];
    serde_json::from_str(content)
        .map_err(|e| EngineError::Service(format!("malformed LLM output: {}", e)))
}
