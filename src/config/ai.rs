// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embedding_dims() -> usize {
    256
}

/// `[ai]` section: which text-generation and embedding backend to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// "openai" | "disabled" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Vector size of the offline hashing embedder.
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            api_key: default_api_key(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            embedding_dims: default_embedding_dims(),
        }
    }
}

impl AiConfig {
    pub fn provider_name(&self) -> String {
        self.provider.trim().to_ascii_lowercase()
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.provider_name().as_str(), "" | "disabled" | "none")
    }

    /// The literal key, or the env var when the key is "ENV".
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if !self.api_key.trim().eq_ignore_ascii_case("env") {
            return Ok(self.api_key.trim().to_string());
        }
        match self.provider_name().as_str() {
            "openai" => env::var(ENV_OPENAI_API_KEY)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("Missing {ENV_OPENAI_API_KEY} env var")),
            other => anyhow::bail!("Unsupported provider in config: {other}"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        match self.provider_name().as_str() {
            "openai" => {}
            other => anyhow::bail!("Unsupported provider in config: {other}"),
        }
        if self.embedding_dims == 0 {
            anyhow::bail!("ai.embedding_dims must be at least 1");
        }
        self.resolve_api_key().map(|_| ())
    }
}
