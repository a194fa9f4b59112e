use super::{CompletionRequest, LLMError, LLMProvider, ModelTier};
use crate::config::OpenAIConfig;
use crate::secrets::SecretString;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub struct OpenAIProvider {
    config: OpenAIConfig,
    api_key: SecretString,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig, api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(170))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            api_key,
            client,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.config.model,
            ModelTier::Fast => &self.config.fast_model,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn check_health(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, request: &CompletionRequest) -> super::Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let api_messages: Vec<_> = request
            .messages
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.to_string(),
                    "content": msg.content
                })
            })
            .collect();

        let payload = json!({
            "model": self.model_for(request.tier),
            "messages": api_messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.unsecure()))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout
                } else {
                    LLMError::NetworkError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 | 403 => LLMError::AuthenticationFailed(text),
                429 => LLMError::RateLimitExceeded,
                code if code >= 500 => {
                    LLMError::ProviderUnavailable(format!("HTTP {}: {}", code, text))
                }
                _ => LLMError::InvalidRequest(text),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;

        let choice = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| LLMError::ParseError("No choices in response".to_string()))?;

        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::trim)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LLMError::EmptyResponse);
        }

        Ok(content.to_string())
    }
}
