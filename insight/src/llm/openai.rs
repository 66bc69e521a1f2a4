//! OpenAI-compatible chat-completions provider.
//!
//! Also serves any endpoint speaking the same wire format (Ollama,
//! vLLM, OpenRouter) through `base_url`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::errors::{EngineError, EngineResult};

use super::{sha256_hex, LlmOptions, LlmProvider, LlmProviderInfo};

pub struct OpenAiLlmProvider {
    config: LlmConfig,
    client: reqwest::Client,
}

/// A single request attempt's failure, tagged with whether an
/// immediate retry is worthwhile (connect errors, timeouts, 5xx).
struct RequestFailure {
    error: EngineError,
    transient: bool,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl OpenAiLlmProvider {
    pub fn new(config: LlmConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EngineError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn request_once(
        &self,
        prompt: &str,
        options: &LlmOptions,
    ) -> Result<String, RequestFailure> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/chat/completions", base_url);

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: options.max_tokens.or(self.config.max_tokens),
            temperature: options.temperature.or(self.config.temperature),
        };
        let payload = serde_json::to_vec(&body).map_err(|e| RequestFailure {
            error: EngineError::Service(format!("failed to serialize request: {}", e)),
            transient: false,
        })?;
        debug!(prompt_hash = %sha256_hex(&payload), model = %self.config.model, "llm request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = self.config.api_key.as_deref() {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder.body(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                RequestFailure {
                    error: EngineError::Timeout(format!(
                        "llm call exceeded {}s",
                        self.config.timeout_seconds
                    )),
                    transient: true,
                }
            } else {
                RequestFailure {
                    error: EngineError::Service(format!("HTTP request failed: {}", e)),
                    transient: e.is_connect(),
                }
            }
        })?;

        let status = response.status();
        let raw = response.text().await.map_err(|e| RequestFailure {
            error: EngineError::Service(format!("failed to read response body: {}", e)),
            transient: true,
        })?;

        if !status.is_success() {
            let preview: String = raw.chars().take(500).collect();
            return Err(RequestFailure {
                error: EngineError::Service(format!(
                    "llm API returned HTTP {}: {}",
                    status, preview
                )),
                transient: status.is_server_error(),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| RequestFailure {
            error: EngineError::Service(format!("unexpected response shape: {}", e)),
            transient: false,
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RequestFailure {
                error: EngineError::Service("response contained no choices".to_string()),
                transient: false,
            })
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn generate(&self, prompt: &str, options: &LlmOptions) -> EngineResult<String> {
        match self.request_once(prompt, options).await {
            Ok(text) => Ok(text),
            Err(failure) if failure.transient => {
                warn!(error = %failure.error, "transient llm failure, retrying once");
                self.request_once(prompt, options)
                    .await
                    .map_err(|f| f.error)
            }
            Err(failure) => Err(failure.error),
        }
    }

    fn info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "openai-compatible".to_string(),
            model: self.config.model.clone(),
        }
    }
}
