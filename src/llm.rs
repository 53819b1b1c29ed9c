//! Language-model provider capability and the OpenAI-compatible adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Provider-neutral prompt: an ordered chat transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    /// Model that actually answered, as reported by the provider.
    pub model: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider is not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Maps an unsuccessful HTTP status to an error. Spend-limit messages
    /// arrive with several status codes, so the body is checked as well.
    pub fn from_status(status: u16, body: String) -> Self {
        let lowered = body.to_lowercase();
        match status {
            429 => ProviderError::RateLimited(body),
            402 => ProviderError::PaymentRequired(body),
            _ if lowered.contains("spend limit") || lowered.contains("insufficient credits") => {
                ProviderError::PaymentRequired(body)
            }
            _ => ProviderError::Http { status, body },
        }
    }
}

/// One capability shared by every provider adapter.
#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt, model: &str, timeout: Duration) -> Result<Completion, ProviderError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Adapter for `/chat/completions` endpoints (OpenRouter and compatible).
pub struct OpenAiCompatibleProvider {
    name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn decode(body: &str, requested_model: &str) -> Result<Completion, ProviderError> {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("response has no choices".to_string()))?;

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
        })
    }
}

#[async_trait]
impl LanguageModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &Prompt, model: &str, timeout: Duration) -> Result<Completion, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(format!("{} has no API key", self.name)));
        }

        let body = ChatCompletionRequest {
            model,
            messages: &prompt.messages,
            temperature: 0.1,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        if !status.is_success() {
            warn!(provider = %self.name, model, status = status.as_u16(), "model call failed");
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        Self::decode(&text, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(ProviderError::from_status(429, "slow down".into()), ProviderError::RateLimited(_)));
        assert!(matches!(ProviderError::from_status(402, String::new()), ProviderError::PaymentRequired(_)));
        assert!(matches!(
            ProviderError::from_status(403, "Key spend limit exceeded".into()),
            ProviderError::PaymentRequired(_)
        ));
        assert!(matches!(
            ProviderError::from_status(500, "boom".into()),
            ProviderError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn test_decode_reads_usage_and_model() {
        let body = r#"{"model":"m-1","choices":[{"message":{"content":"{\"query\":\"SELECT 1\"}"}}],
                       "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let completion = OpenAiCompatibleProvider::decode(body, "fallback").unwrap();
        assert_eq!(completion.model, "m-1");
        assert_eq!(completion.usage.total_tokens, 15);
        assert!(completion.text.contains("SELECT 1"));
    }

    #[test]
    fn test_decode_rejects_missing_choices() {
        assert!(matches!(
            OpenAiCompatibleProvider::decode(r#"{"choices":[]}"#, "m"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            OpenAiCompatibleProvider::decode("<html>", "m"),
            Err(ProviderError::Malformed(_))
        ));
    }
}
