//! Text generation providers.
//!
//! | `generation.provider` | Provider |
//! |-----------------------|----------|
//! | `"disabled"` (default) | [`DisabledGenerator`]: every call fails, answers fall back to listing evidence |
//! | `"openai"` | [`OpenAIGenerator`]: `POST /v1/chat/completions`, needs `OPENAI_API_KEY` |
//! | `"ollama"` | [`OllamaGenerator`]: `POST /api/generate` with `stream: false` |
//!
//! Failures are classified the same way as embeddings (see
//! [`classify_status`](crate::embedding::classify_status)).

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use reporover_core::capability::Generator;
use reporover_core::error::CapabilityError;

use crate::config::GenerationConfig;
use crate::embedding::{http_client, post_json, DEFAULT_OLLAMA_URL, DEFAULT_OPENAI_URL};

/// Generator used when no model is configured.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Fatal(
            "Generation provider is disabled".to_string(),
        ))
    }
}

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            api_key,
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json(request, &body, "OpenAI chat").await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CapabilityError::Fatal("Invalid OpenAI response: missing message content".into())
            })
    }
}

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let request = self
            .client
            .post(format!("{}/api/generate", self.url.trim_end_matches('/')));
        let json = post_json(request, &body, "Ollama generate").await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CapabilityError::Fatal("Invalid Ollama response: missing response".into())
            })
    }
}

/// Create the configured [`Generator`].
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
