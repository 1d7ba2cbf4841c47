use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use ai_client::Claude;
use churnwatch_common::text::clamp_chars;
use churnwatch_common::{ChurnWatchError, ReasonCode, RiskScore};

/// Upper bound on context handed to the model, in characters.
const MAX_CONTEXT_CHARS: usize = 4_000;

const SYSTEM_PROMPT: &str = "You are a retention specialist for a premium bank.";

/// Everything the external generation call gets to see about one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub entity_id: String,
    pub churn_score: RiskScore,
    pub reason: ReasonCode,
    /// Support snippets joined newest first. Empty when none were available.
    pub context: String,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[async_trait]
impl<G: TextGenerator + ?Sized> TextGenerator for Arc<G> {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        (**self).generate(request).await
    }
}

pub fn build_prompt(request: &GenerationRequest) -> String {
    let mut prompt = format!(
        "User ID: {}.\nRisk Score: {}.\nReason: {}.\n",
        request.entity_id, request.churn_score, request.reason
    );
    if !request.context.trim().is_empty() {
        prompt.push_str("Recent support history: ");
        prompt.push_str(clamp_chars(request.context.trim(), MAX_CONTEXT_CHARS));
        prompt.push_str(".\n");
    }
    prompt.push_str(
        "Write a short, polite email offering a $50 statement credit.\n\
         Sign off as \"The Data Team\".",
    );
    prompt
}

// ---------------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------------

/// Retention email drafting backed by the Anthropic Messages API.
pub struct ClaudeGenerator {
    claude: Claude,
}

impl ClaudeGenerator {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            claude: Claude::new(api_key, model).with_max_tokens(600),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.claude = self.claude.with_base_url(url);
        self
    }

    pub fn model(&self) -> &str {
        self.claude.model()
    }
}

#[async_trait]
impl TextGenerator for ClaudeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let text = self
            .claude
            .chat_completion(SYSTEM_PROMPT, build_prompt(request))
            .await
            .map_err(|e| ChurnWatchError::Generation(format!("{}: {e:#}", request.entity_id)))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChurnWatchError::Generation(format!(
                "{}: model returned empty content",
                request.entity_id
            ))
            .into());
        }
        Ok(text.to_string())
    }
}
