//! Built-in model registry with a public lookup API.

use crate::{Api, Model, Provider};

struct ModelEntry {
    id: &'static str,
    name: &'static str,
    provider: Provider,
    context_window: u32,
    max_tokens: u32,
}

const MODEL_ENTRIES: &[ModelEntry] = &[
    ModelEntry {
        id: "claude-sonnet-4-5-20250929",
        name: "Claude Sonnet 4.5",
        provider: Provider::Anthropic,
        context_window: 200_000,
        max_tokens: 64_000,
    },
    ModelEntry {
        id: "claude-opus-4-1-20250805",
        name: "Claude Opus 4.1",
        provider: Provider::Anthropic,
        context_window: 200_000,
        max_tokens: 32_000,
    },
    ModelEntry {
        id: "claude-haiku-4-5-20251001",
        name: "Claude Haiku 4.5",
        provider: Provider::Anthropic,
        context_window: 200_000,
        max_tokens: 64_000,
    },
    ModelEntry {
        id: "gpt-4.1",
        name: "GPT-4.1",
        provider: Provider::OpenAI,
        context_window: 1_047_576,
        max_tokens: 32_768,
    },
    ModelEntry {
        id: "gpt-4o",
        name: "GPT-4o",
        provider: Provider::OpenAI,
        context_window: 128_000,
        max_tokens: 16_384,
    },
];

/// Default model used when nothing else is configured
pub const DEFAULT_MODEL_ID: &str = "claude-sonnet-4-5-20250929";

/// The API and base URL a provider is reached through.
pub fn provider_endpoint(provider: Provider) -> (Api, &'static str) {
    match provider {
        Provider::Anthropic => (Api::AnthropicMessages, "https://api.anthropic.com"),
        Provider::OpenAI => (Api::OpenAICompletions, "https://api.openai.com/v1"),
        Provider::OpenRouter => (Api::OpenAICompletions, "https://openrouter.ai/api/v1"),
        Provider::Ollama => (Api::OpenAICompletions, "http://localhost:11434/v1"),
        Provider::Custom => (Api::OpenAICompletions, ""),
    }
}

impl ModelEntry {
    fn to_model(&self) -> Model {
        let (api, base_url) = provider_endpoint(self.provider);
        Model {
            id: self.id.to_string(),
            name: self.name.to_string(),
            api,
            provider: self.provider,
            base_url: base_url.to_string(),
            context_window: self.context_window,
            max_tokens: self.max_tokens,
            headers: Default::default(),
        }
    }
}

/// Look up a built-in model by ID.
pub fn get_model_by_id(id: &str) -> Option<Model> {
    MODEL_ENTRIES.iter().find(|e| e.id == id).map(ModelEntry::to_model)
}

/// All built-in models.
pub fn get_all_models() -> Vec<Model> {
    MODEL_ENTRIES.iter().map(ModelEntry::to_model).collect()
}

/// Resolve a model id for a provider, constructing a generic entry for ids
/// the registry does not know about.
pub fn resolve_model(provider: Provider, id: &str) -> Model {
    if let Some(model) = get_model_by_id(id) {
        if model.provider == provider {
            return model;
        }
    }

    let (api, base_url) = provider_endpoint(provider);
    Model {
        id: id.to_string(),
        name: id.to_string(),
        api,
        provider,
        base_url: base_url.to_string(),
        context_window: 128_000,
        max_tokens: 8192,
        headers: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_model() {
        let model = get_model_by_id(DEFAULT_MODEL_ID).unwrap();
        assert_eq!(model.provider, Provider::Anthropic);
        assert_eq!(model.api, Api::AnthropicMessages);
        assert_eq!(model.base_url, "https://api.anthropic.com");
    }

    #[test]
    fn test_unknown_model_is_none() {
        assert!(get_model_by_id("not-a-model").is_none());
    }

    #[test]
    fn test_resolve_unknown_model_uses_provider_endpoint() {
        let model = resolve_model(Provider::Ollama, "llama3.1");
        assert_eq!(model.id, "llama3.1");
        assert_eq!(model.api, Api::OpenAICompletions);
        assert_eq!(model.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_resolve_known_model_for_other_provider_is_generic() {
        let model = resolve_model(Provider::OpenRouter, "gpt-4o");
        assert_eq!(model.provider, Provider::OpenRouter);
        assert_eq!(model.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn test_all_models_unique_ids() {
        let models = get_all_models();
        let mut ids: Vec<_> = models.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), models.len());
    }
}
