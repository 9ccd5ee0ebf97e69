//! LLM Provider implementations

pub mod anthropic;
pub mod openai;

use crate::{Context, Error, MessageEventStream, Model, Result, StreamOptions};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a response from the LLM
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &StreamOptions,
    ) -> Result<MessageEventStream>;
}

/// Get an API key from environment or provided value
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

/// Build a header map from fixed pairs plus the model's extra headers.
pub(crate) fn build_headers(fixed: &[(&str, String)], model: &Model) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let extra = model.headers.iter().map(|(k, v)| (k.as_str(), v.clone()));

    for (key, value) in fixed.iter().cloned().chain(extra) {
        let name = key
            .parse::<HeaderName>()
            .map_err(|e| Error::InvalidConfig(format!("header name '{}': {}", key, e)))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::InvalidConfig(format!("header '{}': {}", key, e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}
