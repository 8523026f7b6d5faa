//! Provider-abstracted LLM clients for the judge.
//!
//! The provider is chosen explicitly or inferred from the model-name
//! prefix; unknown prefixes fall back to the OpenAI-compatible client with
//! a warning.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use utils::msg;

const JUDGE_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a strict, detail-oriented code review judge \
for software-engineering patches. Always respond with valid JSON.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Api(String),
    #[error("invalid provider {0:?}; must be 'openai' or 'anthropic'")]
    InvalidProvider(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Make a single completion call and return the response text.
    async fn call(
        &self,
        prompt: &str,
        model: &str,
        system_message: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, ApiError>;
}

/// OpenAI chat-completions client; also serves DeepSeek and other
/// compatible APIs via `base_url`.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let base_url = base_url
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url,
        }
    }
}

#[async_trait]
impl ApiClient for OpenAiClient {
    async fn call(
        &self,
        prompt: &str,
        model: &str,
        system_message: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, ApiError> {
        let system = system_message.unwrap_or(DEFAULT_SYSTEM_MESSAGE);
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "temperature": temperature,
            "response_format": {"type": "json_object"},
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        tracing::info!(model, "calling OpenAI-compatible API");
        let resp: Value = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(JUDGE_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("");
        if content.is_empty() {
            return Err(ApiError::Api(
                "empty content in response from OpenAI API".to_string(),
            ));
        }
        tracing::debug!(chars = content.len(), "received OpenAI response");
        Ok(content.to_string())
    }
}

/// Anthropic messages-API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let base_url = base_url
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("https://api.anthropic.com")
            .trim_end_matches('/')
            .to_string();
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url,
        }
    }
}

#[async_trait]
impl ApiClient for AnthropicClient {
    async fn call(
        &self,
        prompt: &str,
        model: &str,
        system_message: Option<&str>,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, ApiError> {
        let system = system_message.unwrap_or(DEFAULT_SYSTEM_MESSAGE);
        let body = json!({
            "model": model,
            "max_tokens": max_tokens.unwrap_or(4096),
            "temperature": temperature,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        tracing::info!(model, "calling Anthropic API");
        let resp: Value = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(JUDGE_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = resp
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or("");
        if content.is_empty() {
            return Err(ApiError::Api(
                "empty content in response from Anthropic API".to_string(),
            ));
        }
        tracing::debug!(chars = content.len(), "received Anthropic response");
        Ok(content.to_string())
    }
}

/// Select the API client for a model.
///
/// An explicit `provider` takes precedence; otherwise the provider is
/// inferred from the model name: `gpt-*`, `o1-*`, `deepseek-*` → OpenAI,
/// `claude-*` → Anthropic, anything else → OpenAI with a warning.
pub fn get_api_client(
    model_name: &str,
    api_key: &str,
    base_url: Option<&str>,
    provider: Option<&str>,
) -> Result<Box<dyn ApiClient>, ApiError> {
    if let Some(provider) = provider {
        return match provider.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Box::new(AnthropicClient::new(api_key, base_url))),
            "openai" => Ok(Box::new(OpenAiClient::new(api_key, base_url))),
            other => Err(ApiError::InvalidProvider(other.to_string())),
        };
    }

    let model_lower = model_name.to_lowercase();
    if model_lower.starts_with("gpt-")
        || model_lower.starts_with("o1-")
        || model_lower.starts_with("deepseek-")
    {
        Ok(Box::new(OpenAiClient::new(api_key, base_url)))
    } else if model_lower.starts_with("claude-") {
        Ok(Box::new(AnthropicClient::new(api_key, base_url)))
    } else {
        msg::warn(format!(
            "Unknown model provider for {model_name}, defaulting to OpenAI"
        ));
        Ok(Box::new(OpenAiClient::new(api_key, base_url)))
    }
}
