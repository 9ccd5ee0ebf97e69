//! Transport abstraction for issuing one LM call per turn

use async_trait::async_trait;
use sortie_ai::providers::LlmProvider;
use sortie_ai::providers::anthropic::AnthropicProvider;
use sortie_ai::providers::openai::OpenAIProvider;
use sortie_ai::{
    Api, Context, Message, MessageEventStream, Model, StreamOptions, Usage, collect_response,
};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::history::ToolCallRequest;

/// Per-turn request settings
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Available tools (as API definitions)
    pub tools: Vec<sortie_ai::Tool>,
    /// Model to use
    pub model: Model,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Temperature
    pub temperature: Option<f32>,
}

/// What the model produced on one turn
#[derive(Debug, Clone)]
pub struct Completion {
    /// Concatenated text blocks, `None` when the response carried no text
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

impl Completion {
    pub fn new(text: Option<String>, tool_calls: Vec<ToolCallRequest>, usage: Usage) -> Self {
        Self {
            text,
            tool_calls,
            usage,
        }
    }

    /// Split a finished assistant message into text and tool calls
    pub fn from_message(message: &Message, usage: Usage) -> Self {
        let has_text = message.content().iter().any(|c| c.as_text().is_some());
        Self {
            text: has_text.then(|| message.text()),
            tool_calls: ToolCallRequest::from_message(message),
            usage,
        }
    }
}

/// Issues the LM call for a turn
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the built messages and wait for the complete response.
    ///
    /// Implementations should stop waiting once `cancel` fires and return
    /// an error for which `is_cancellation()` holds.
    async fn complete(
        &self,
        messages: Vec<Message>,
        config: &TurnConfig,
        cancel: CancellationToken,
    ) -> Result<Completion>;
}

/// Resolve the provider for a model and open its response stream
async fn create_provider_and_stream(
    model: &Model,
    context: &Context,
    options: &StreamOptions,
    api_key: Option<&str>,
) -> sortie_ai::Result<MessageEventStream> {
    let key = match api_key {
        Some(key) => Some(key.to_string()),
        None => model
            .provider
            .api_key_env_var()
            .and_then(|var| std::env::var(var).ok()),
    };

    match model.api {
        Api::AnthropicMessages => {
            let provider = match key {
                Some(key) => AnthropicProvider::new(key),
                None => AnthropicProvider::from_env()?,
            };
            provider.stream(model, context, options).await
        }
        Api::OpenAICompletions => {
            let provider = match key {
                Some(key) => OpenAIProvider::new(key),
                None if model.provider.api_key_env_var().is_none() => OpenAIProvider::without_key(),
                None => return Err(sortie_ai::Error::InvalidApiKey),
            };
            provider.stream(model, context, options).await
        }
    }
}

/// Direct provider transport - calls LLM APIs directly.
///
/// A failed call is returned as-is; this transport never retries.
#[derive(Debug, Clone, Default)]
pub struct ProviderTransport {
    api_key: Option<String>,
}

impl ProviderTransport {
    /// Create a new provider transport that reads keys from the environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a specific API key
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
        }
    }
}

#[async_trait]
impl Transport for ProviderTransport {
    async fn complete(
        &self,
        messages: Vec<Message>,
        config: &TurnConfig,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let context = Context {
            system_prompt: config.system_prompt.clone(),
            messages,
            tools: config.tools.clone(),
        };
        let options = StreamOptions {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        let request = async {
            let stream =
                create_provider_and_stream(&config.model, &context, &options, self.api_key.as_deref())
                    .await?;
            collect_response(stream).await
        };

        let (message, usage) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(sortie_ai::Error::Aborted.into()),
            result = request => result?,
        };

        tracing::debug!(
            model = %config.model.id,
            input = usage.input,
            output = usage.output,
            "completion received"
        );
        Ok(Completion::from_message(&message, usage))
    }
}
