//! OpenRouter backend (OpenAI-compatible chat completions)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use studyweave_config::ProviderConfig;
use studyweave_utils::error::LlmError;

use crate::http_client::HttpClient;
use crate::types::{LlmBackend, LlmInvocation, LlmResult, Message, Role, StopReason};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const DEFAULT_REFERER: &str = "https://github.com/studyweave/studyweave";

const DEFAULT_TITLE: &str = "studyweave";

pub(crate) struct OpenRouterBackend {
    client: HttpClient,
    base_url: String,
    api_key: String,
    default_model: String,
    temperature: f32,
}

impl OpenRouterBackend {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        default_model: String,
        temperature: f32,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            client: HttpClient::new()?,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            default_model,
            temperature,
        })
    }

    /// OpenRouter hosts many models, so one must be named explicitly.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Misconfiguration` if the API key variable is unset
    /// or no model is configured
    pub fn new_from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            LlmError::Misconfiguration(format!(
                "OpenRouter API key not found in environment variable '{}'. \
                 Please set this variable or configure a different api_key_env in [llm.openrouter].",
                config.api_key_env
            ))
        })?;

        let model = config.model.clone().ok_or_else(|| {
            LlmError::Misconfiguration(
                "OpenRouter model not specified in configuration. \
                 Please set [llm.openrouter] model = \"vendor/model-name\"."
                    .to_string(),
            )
        })?;

        Self::new(api_key, config.base_url.clone(), model, config.temperature)
    }

    fn convert_messages(messages: &[Message]) -> Vec<OpenAiMessage<'_>> {
        messages
            .iter()
            .map(|msg| OpenAiMessage {
                role: match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &msg.content,
            })
            .collect()
    }
}

#[async_trait]
impl LlmBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn invoke(&self, inv: LlmInvocation) -> Result<LlmResult, LlmError> {
        let model = if inv.model.is_empty() {
            self.default_model.clone()
        } else {
            inv.model.clone()
        };

        debug!(
            provider = "openrouter",
            model = %model,
            max_tokens = inv.max_output_tokens,
            timeout_secs = inv.timeout.as_secs(),
            "Invoking OpenRouter backend"
        );

        let body = OpenRouterRequest {
            model: &model,
            messages: Self::convert_messages(&inv.messages),
            max_tokens: inv.max_output_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let request = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", DEFAULT_REFERER)
            .header("X-Title", DEFAULT_TITLE)
            .header("Content-Type", "application/json")
            .json(&body);

        let response = self.client.send(request, inv.timeout, "openrouter").await?;
        let body: OpenRouterResponse = response.json().await.map_err(|e| {
            LlmError::InvalidResponse(format!("Failed to decode OpenRouter response: {e}"))
        })?;

        let choice = body.choices.into_iter().next().ok_or_else(|| {
            LlmError::InvalidResponse("OpenRouter response missing choices[0]".to_string())
        })?;
        let text = choice.message.content.unwrap_or_default();

        let mut result = LlmResult::new(text, "openrouter", model)
            .with_stop_reason(StopReason::from_openai(choice.finish_reason.as_deref()));
        if let Some(usage) = body.usage {
            result = result.with_tokens(usage.prompt_tokens, usage.completion_tokens);
        }

        debug!(
            provider = "openrouter",
            stop_reason = ?result.stop_reason,
            tokens_input = ?result.tokens_input,
            tokens_output = ?result.tokens_output,
            "OpenRouter invocation completed"
        );

        Ok(result)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenRouterRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
