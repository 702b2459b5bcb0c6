//! OpenAI-compatible chat completions client.
//!
//! Works against OpenAI, OpenRouter, Ollama, vLLM and anything else that
//! speaks `POST {base_url}/chat/completions`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatRole, FinishReason, GenerationRequest, GenerationResponse, GenerationService};
use crate::domain::GenerationError;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token (optional for local servers)
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("GROUNDCHECK_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:11434/v1".to_string()),
            model: std::env::var("GROUNDCHECK_LLM_MODEL")
                .unwrap_or_else(|_| "llama3.1".to_string()),
            api_key: std::env::var("GROUNDCHECK_LLM_API_KEY").ok(),
            request_timeout_ms: 60_000,
        }
    }
}

impl OpenAiCompatConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            api_key: None,
            request_timeout_ms: 60_000,
        }
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }
}

/// Generation service backed by an OpenAI-compatible HTTP API.
pub struct OpenAiCompatGenerator {
    config: OpenAiCompatConfig,
    http_client: reqwest::Client,
}

impl OpenAiCompatGenerator {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, GenerationError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("groundcheck/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn from_env() -> Result<Self, GenerationError> {
        Self::new(OpenAiCompatConfig::from_env())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
        messages.extend(request.messages.iter().map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            json!({"role": role, "content": m.content})
        }));

        json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

/// Pull text and finish reason out of a chat completions response body.
pub(crate) fn parse_completion(body: &Value) -> Result<GenerationResponse, GenerationError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| GenerationError::Malformed("response has no choices".into()))?;

    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| GenerationError::Malformed("choice has no message content".into()))?;

    let finish_reason =
        FinishReason::from_wire(choice.get("finish_reason").and_then(Value::as_str));

    Ok(GenerationResponse {
        text: text.to_string(),
        finish_reason,
    })
}

#[async_trait]
impl GenerationService for OpenAiCompatGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let mut http = self
            .http_client
            .post(self.endpoint())
            .json(&self.request_body(&request));
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout {
                    timeout_ms: self.config.request_timeout_ms,
                }
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        let parsed = parse_completion(&body)?;
        debug!(
            model = %self.config.model,
            chars = parsed.text.len(),
            finish_reason = ?parsed.finish_reason,
            "generation completed"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_reads_text_and_finish_reason() {
        let body = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Paris. [Claim: c1]"},
                "finish_reason": "length"
            }]
        });
        let parsed = parse_completion(&body).unwrap();
        assert_eq!(parsed.text, "Paris. [Claim: c1]");
        assert!(parsed.finish_reason.is_truncated());
    }

    #[test]
    fn test_parse_completion_rejects_empty_choices() {
        let err = parse_completion(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, GenerationError::Malformed(_)));
    }

    #[test]
    fn test_request_body_puts_system_prompt_first() {
        let generator =
            OpenAiCompatGenerator::new(OpenAiCompatConfig::new("http://localhost:1/v1/", "m"))
                .unwrap();
        assert_eq!(generator.endpoint(), "http://localhost:1/v1/chat/completions");

        let body = generator.request_body(
            &GenerationRequest::new("be precise", "hello")
                .with_temperature(0.0)
                .with_max_tokens(64),
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 64);
    }
}
