//! Deterministic stub provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{EngineError, EngineResult};

use super::{LlmOptions, LlmProvider, LlmProviderInfo};

enum StubBehavior {
    /// Echo a canned acknowledgement of the prompt.
    Echo,
    /// Pop scripted responses in order; error once the script runs out.
    Scripted(Mutex<VecDeque<String>>),
}

pub struct StubLlmProvider {
    behavior: StubBehavior,
}

impl StubLlmProvider {
    pub fn echo() -> Self {
        Self {
            behavior: StubBehavior::Echo,
        }
    }

    /// Responses are returned in order, one per `generate` call.
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            behavior: StubBehavior::Scripted(Mutex::new(
                responses.into_iter().map(Into::into).collect(),
            )),
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn generate(&self, prompt: &str, _options: &LlmOptions) -> EngineResult<String> {
        match &self.behavior {
            StubBehavior::Echo => Ok(format!(
                "stub response ({} prompt chars)",
                prompt.chars().count()
            )),
            StubBehavior::Scripted(queue) => queue
                .lock()
                .expect("stub response queue poisoned")
                .pop_front()
                .ok_or_else(|| {
                    EngineError::Service("stub provider ran out of scripted responses".to_string())
                }),
        }
    }

    fn info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "stub".to_string(),
            model: "stub-model".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let stub = StubLlmProvider::with_responses(["one", "two"]);
        let options = LlmOptions::default();
        assert_eq!(stub.generate("p", &options).await.unwrap(), "one");
        assert_eq!(stub.generate("p", &options).await.unwrap(), "two");
        assert!(stub.generate("p", &options).await.is_err());
    }
}
