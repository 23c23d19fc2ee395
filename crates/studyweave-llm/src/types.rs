//! Core types of the provider boundary

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use studyweave_utils::error::LlmError;
use studyweave_utils::types::{Phase, TokenUsage};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Input to one provider invocation
#[derive(Debug, Clone)]
pub struct LlmInvocation {
    pub phase: Phase,
    pub chapter_id: String,
    pub target_id: Option<String>,
    /// Empty means the backend's configured model.
    pub model: String,
    pub timeout: Duration,
    pub messages: Vec<Message>,
    /// Output token budget for this attempt.
    pub max_output_tokens: u32,
}

impl LlmInvocation {
    #[must_use]
    pub fn new(
        phase: Phase,
        chapter_id: impl Into<String>,
        timeout: Duration,
        messages: Vec<Message>,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            phase,
            chapter_id: chapter_id.into(),
            target_id: None,
            model: String::new(),
            timeout,
            messages,
            max_output_tokens,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

/// Why the provider stopped generating, normalized across providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    /// The output budget ran out; the text is truncated.
    MaxTokens,
    StopSequence,
    Other,
}

impl StopReason {
    /// Anthropic `stop_reason` values.
    #[must_use]
    pub fn from_anthropic(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn") => Self::EndTurn,
            Some("max_tokens") => Self::MaxTokens,
            Some("stop_sequence") => Self::StopSequence,
            _ => Self::Other,
        }
    }

    /// OpenAI-compatible `finish_reason` values.
    #[must_use]
    pub fn from_openai(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") => Self::EndTurn,
            Some("length") => Self::MaxTokens,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub const fn is_truncated(self) -> bool {
        matches!(self, Self::MaxTokens)
    }
}

/// Result of one provider invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResult {
    pub text: String,
    pub provider: String,
    pub model_used: String,
    pub stop_reason: StopReason,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
}

impl LlmResult {
    #[must_use]
    pub fn new(
        text: impl Into<String>,
        provider: impl Into<String>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            provider: provider.into(),
            model_used: model_used.into(),
            stop_reason: StopReason::EndTurn,
            tokens_input: None,
            tokens_output: None,
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_input = Some(input);
        self.tokens_output = Some(output);
        self
    }

    #[must_use]
    pub fn with_stop_reason(mut self, stop_reason: StopReason) -> Self {
        self.stop_reason = stop_reason;
        self
    }

    /// Token usage, zero where the provider did not report it.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.tokens_input.unwrap_or(0),
            self.tokens_output.unwrap_or(0),
        )
    }
}

/// Information about a fallback provider being used instead of the primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmFallbackInfo {
    pub primary_provider: String,
    pub fallback_provider: String,
    /// Redacted construction error of the primary provider.
    pub reason: String,
}

/// Trait for provider implementations
///
/// The only network-facing contract: one prompt in, one text block with a
/// stop reason and token counts out.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider name used in logs and reports.
    fn name(&self) -> &str;

    /// Invoke the provider once. Implementations never retry.
    ///
    /// # Errors
    ///
    /// Returns `LlmError` for transport failures, provider errors (auth,
    /// quota, outages), timeouts and undecodable responses.
    async fn invoke(&self, inv: LlmInvocation) -> Result<LlmResult, LlmError>;
}
