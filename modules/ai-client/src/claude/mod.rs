pub(crate) mod types;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Longest slice of an error body kept in the returned error.
const MAX_ERROR_BODY: usize = 512;

/// Anthropic Messages API client bound to one model.
///
/// Cheap to clone: the underlying `reqwest::Client` shares its connection pool.
#[derive(Clone)]
pub struct Claude {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl Claude {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: 1024,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        debug!(model = %request.model, "Claude chat request");

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await
            .context("Claude API request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let end = body
                .char_indices()
                .nth(MAX_ERROR_BODY)
                .map(|(i, _)| i)
                .unwrap_or(body.len());
            return Err(anyhow!("Claude API error ({status}): {}", &body[..end]));
        }

        response
            .json()
            .await
            .context("Failed to decode Claude API response")
    }

    /// Single-turn completion. Errors when the API fails, returns no text, or
    /// stops at the token limit.
    pub async fn chat_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let request = ChatRequest::new(&self.model)
            .system(system)
            .message(WireMessage::user(user))
            .max_tokens(self.max_tokens)
            .temperature(0.3);

        let response = self.send(&request).await?;
        if response.is_truncated() {
            return Err(anyhow!(
                "Claude response truncated at {} max tokens",
                self.max_tokens
            ));
        }

        response
            .text()
            .ok_or_else(|| anyhow!("No text response from Claude"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_new() {
        let ai = Claude::new("sk-ant-test", "claude-haiku-4-5-20251001");
        assert_eq!(ai.model(), "claude-haiku-4-5-20251001");
        assert_eq!(ai.api_key, "sk-ant-test");
        assert_eq!(ai.base_url, ANTHROPIC_API_URL);
    }

    #[test]
    fn test_claude_with_base_url() {
        let ai = Claude::new("sk-ant-test", "claude-haiku-4-5-20251001")
            .with_base_url("https://custom.api.com")
            .with_max_tokens(256);
        assert_eq!(ai.base_url, "https://custom.api.com");
        assert_eq!(ai.max_tokens, 256);
    }
}
