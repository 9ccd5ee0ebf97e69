//! Configuration file support

use serde::{Deserialize, Serialize};
use sortie_ai::Provider;
use std::fs;
use std::path::{Path, PathBuf};

/// Turn limit used when neither the flag nor the config sets one
pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Configuration for sortie
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model to use
    pub model: Option<String>,
    /// Default provider
    pub provider: Option<String>,
    /// Default turn limit per conversation
    pub max_turns: Option<u32>,
    /// Directory of instruction files offered to automatic selection
    pub instructions_dir: Option<PathBuf>,
    /// API keys (alternative to environment variables)
    #[serde(default)]
    pub api_keys: ApiKeys,
}

/// API key configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub openrouter: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sortie")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SORTIE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`. A missing or malformed file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the example config to `path` unless a file is already there
    pub fn init_at(path: &Path) -> std::io::Result<PathBuf> {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())?;
        Ok(path.to_path_buf())
    }

    /// Create a config file at the default location if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        Self::init_at(&Self::config_path())
    }

    /// Get API key for a provider, checking config then env
    pub fn get_api_key(&self, provider: Provider) -> Option<String> {
        let from_config = match provider {
            Provider::Anthropic => self.api_keys.anthropic.clone(),
            Provider::OpenAI => self.api_keys.openai.clone(),
            Provider::OpenRouter => self.api_keys.openrouter.clone(),
            Provider::Ollama | Provider::Custom => None,
        };

        from_config.or_else(|| {
            provider
                .api_key_env_var()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# sortie configuration file
# Place at ~/.config/sortie/config.toml (Linux/Mac) or %APPDATA%\sortie\config.toml (Windows)

# Default model to use
model = "claude-sonnet-4-5-20250929"

# Default provider (anthropic, openai, openrouter, ollama)
provider = "anthropic"

# Turns allowed per conversation before it stops with max-turns-reached
max_turns = 10

# Markdown files here are offered to --auto-instructions (optional)
# instructions_dir = "~/.config/sortie/instructions"

# API keys (optional - can also use environment variables)
[api_keys]
# anthropic = "sk-ant-..."
# openai = "sk-..."
# openrouter = "sk-or-..."
"#
}
