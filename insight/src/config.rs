//! Engine configuration.
//!
//! Defaults mirror the deployment the engine was extracted from; every
//! field can be overridden through `INSIGHT_*` environment variables.

use serde::{Deserialize, Serialize};

/// Supported LLM provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    /// Deterministic scripted responses, for tests and offline runs.
    Stub,
    /// OpenAI chat-completions API.
    OpenAi,
    /// Any OpenAI-compatible endpoint (Ollama, vLLM, OpenRouter) via
    /// `base_url`.
    Local,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider_type: LlmProviderType,
    /// Model identifier passed through to the provider.
    pub model: String,
    pub api_key: Option<String>,
    /// Override endpoint; required for `Local`.
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Bound on each provider call; expiry surfaces as a service error.
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider_type: LlmProviderType::Stub,
            model: "stub-model".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: None,
            timeout_seconds: 30,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    /// Bound on one capability invocation end to end.
    pub step_timeout_seconds: u64,
    /// Bound on one query execution against the dataset store.
    pub query_timeout_seconds: u64,
    /// Correction attempts per query after the original fails.
    pub max_corrections: u32,
    /// Idle window after which an open event stream receives its
    /// timeout terminal.
    pub stream_inactivity_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            step_timeout_seconds: 300,
            query_timeout_seconds: 30,
            max_corrections: 1,
            stream_inactivity_timeout_seconds: 120,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Build a configuration from `INSIGHT_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let provider_type = match std::env::var("INSIGHT_LLM_PROVIDER").as_deref() {
            Ok("openai") => LlmProviderType::OpenAi,
            Ok("local") => LlmProviderType::Local,
            _ => LlmProviderType::Stub,
        };
        Self {
            llm: LlmConfig {
                provider_type,
                model: std::env::var("INSIGHT_LLM_MODEL")
                    .unwrap_or_else(|_| defaults.llm.model.clone()),
                api_key: std::env::var("INSIGHT_LLM_API_KEY").ok(),
                base_url: std::env::var("INSIGHT_LLM_BASE_URL").ok(),
                max_tokens: std::env::var("INSIGHT_LLM_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .or(defaults.llm.max_tokens),
                temperature: std::env::var("INSIGHT_LLM_TEMPERATURE")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                timeout_seconds: env_u64(
                    "INSIGHT_LLM_TIMEOUT_SECONDS",
                    defaults.llm.timeout_seconds,
                ),
            },
            step_timeout_seconds: env_u64(
                "INSIGHT_STEP_TIMEOUT_SECONDS",
                defaults.step_timeout_seconds,
            ),
            query_timeout_seconds: env_u64(
                "INSIGHT_QUERY_TIMEOUT_SECONDS",
                defaults.query_timeout_seconds,
            ),
            max_corrections: env_u64("INSIGHT_MAX_CORRECTIONS", defaults.max_corrections as u64)
                as u32,
            stream_inactivity_timeout_seconds: env_u64(
                "INSIGHT_STREAM_INACTIVITY_TIMEOUT_SECONDS",
                defaults.stream_inactivity_timeout_seconds,
            ),
        }
    }
}
