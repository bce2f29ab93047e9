//! Text-generation collaborator: provider abstraction over chat completions.
//!
//! Callers treat every error as "no text"; the synthesizer and classifier have
//! their own fallbacks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.2,
            max_tokens: 600,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String>;

    /// Structured output. `schema` describes the expected object and is shown to the model.
    async fn generate_json(&self, prompt: &str, schema: &serde_json::Value)
        -> Result<serde_json::Value>;

    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type DynGenerator = Arc<dyn Generator>;

/// Factory: `openai` builds the real provider, anything disabled gets `DisabledGenerator`.
pub fn build_generator(config: &AiConfig) -> Result<DynGenerator> {
    if !config.enabled() {
        return Ok(Arc::new(DisabledGenerator));
    }
    match config.provider_name().as_str() {
        "openai" => Ok(Arc::new(OpenAiGenerator::from_config(config)?)),
        other => bail!("Unsupported provider in config: {other}"),
    }
}

/// Always fails; drives the templated fallbacks.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn generate(&self, _prompt: &str, _opts: &GenerateOptions) -> Result<String> {
        bail!("text generation disabled")
    }

    async fn generate_json(
        &self,
        _prompt: &str,
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        bail!("text generation disabled")
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// OpenAI Chat Completions.
pub struct OpenAiGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn from_config(config: &AiConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("news-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn chat(
        &self,
        system: Option<&str>,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system {
            messages.push(Msg {
                role: "system",
                content: sys,
            });
        }
        messages.push(Msg {
            role: "user",
            content: prompt,
        });
        let req = Req {
            model: &self.model,
            messages,
            temperature,
            max_tokens,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("openai: sending chat request")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("openai: chat completion returned {status}");
        }
        let body: Resp = resp.json().await.context("openai: decoding response")?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let content = content.trim().to_string();
        if content.is_empty() {
            bail!("openai: empty completion");
        }
        Ok(content)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String> {
        self.chat(
            opts.system.as_deref(),
            prompt,
            opts.temperature,
            opts.max_tokens,
            false,
        )
        .await
    }

    async fn generate_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let system = format!(
            "You are a careful news editor. Reply with ONE JSON object only, matching this schema:\n{schema}"
        );
        let raw = self.chat(Some(&system), prompt, 0.2, 1500, true).await?;
        parse_json_reply(&raw)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Extract the JSON object from a model reply, tolerating code fences and chatter.
pub fn parse_json_reply(raw: &str) -> Result<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&trimmed[s..=e])
            .map_err(|err| anyhow!("reply is not valid JSON: {err}")),
        _ => bail!("reply contains no JSON object"),
    }
}
