//! Embedding providers.
//!
//! | `embedding.provider` | Provider | Notes |
//! |----------------------|----------|-------|
//! | `"hash"` (default) | [`HashEmbedder`] | Offline feature hashing over identifier tokens |
//! | `"openai"` | [`OpenAIEmbedder`] | `POST /v1/embeddings`, needs `OPENAI_API_KEY` |
//! | `"ollama"` | [`OllamaEmbedder`] | `POST /api/embed` on a local Ollama server |
//!
//! Providers make a single attempt per call. Failures are classified so the
//! ingestion and query steps can retry them:
//! - HTTP 429 and 5xx → transient
//! - other HTTP 4xx → fatal
//! - network errors and timeouts → transient
//!
//! # Example
//!
//! ```rust
//! # use reporover::config::EmbeddingConfig;
//! # use reporover::embedding::create_embedder;
//! let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
//! assert_eq!(embedder.model_name(), "hash");
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use reporover_core::capability::Embedder;
use reporover_core::embedding::l2_normalize;
use reporover_core::error::CapabilityError;

use crate::config::EmbeddingConfig;

pub const DEFAULT_HASH_DIMS: usize = 256;
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Map an HTTP failure to a capability error.
pub fn classify_status(status: reqwest::StatusCode, context: &str, body: &str) -> CapabilityError {
    let message = format!("{} error {}: {}", context, status, body.trim());
    if status.as_u16() == 429 || status.is_server_error() {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Fatal(message)
    }
}

/// Map a transport failure to a capability error.
pub fn classify_request_error(e: reqwest::Error, context: &str) -> CapabilityError {
    if e.is_builder() {
        CapabilityError::Fatal(format!("{}: {}", context, e))
    } else {
        CapabilityError::Transient(format!("{}: {}", context, e))
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

/// POST a JSON body and return the JSON response, classifying failures.
pub(crate) async fn post_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
    context: &str,
) -> Result<serde_json::Value, CapabilityError> {
    let response = request
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| classify_request_error(e, context))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, context, &text));
    }
    response
        .json()
        .await
        .map_err(|e| CapabilityError::Fatal(format!("{}: invalid response: {}", context, e)))
}

// ============ Hash Embedder ============

/// Deterministic offline embedder.
///
/// Each identifier-like token (split on non-alphanumerics, then on `_` and
/// camelCase boundaries) is hashed into one of `dims` buckets with a signed
/// weight; the vector is L2-normalized. Texts sharing vocabulary land close
/// together, which is enough for symbol-heavy questions about code.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[index] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

/// Lowercased tokens: whole words plus their snake_case and camelCase parts.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_lowercase();
        let mut parts = Vec::new();
        for piece in word.split('_').filter(|p| !p.is_empty()) {
            let mut current = String::new();
            for c in piece.chars() {
                if c.is_uppercase() && !current.is_empty() {
                    parts.push(std::mem::take(&mut current).to_lowercase());
                }
                current.push(c);
            }
            if !current.is_empty() {
                parts.push(current.to_lowercase());
            }
        }
        if parts.len() > 1 {
            out.extend(parts);
        }
        out.push(lower);
    }
    out
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI Embedder ============

/// Embedder backed by the OpenAI embeddings API.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            api_key,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json(request, &body, "OpenAI embeddings").await?;
        let vectors = parse_openai_response(&json)?;
        check_shape(vectors, texts.len(), self.dims)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            CapabilityError::Fatal("Invalid OpenAI response: missing data array".into())
        })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                CapabilityError::Fatal("Invalid OpenAI response: missing embedding".into())
            })?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Embedder ============

/// Embedder backed by a local Ollama server.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')));
        let json = post_json(request, &body, "Ollama embeddings").await?;
        let vectors = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                CapabilityError::Fatal("Invalid Ollama response: missing embeddings".into())
            })?
            .iter()
            .map(|v| v.as_array().map(|a| to_f32(a)).unwrap_or_default())
            .collect();
        check_shape(vectors, texts.len(), self.dims)
    }
}

fn to_f32(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// One vector per input, each of the configured width.
fn check_shape(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, CapabilityError> {
    if vectors.len() != expected {
        return Err(CapabilityError::Fatal(format!(
            "embedding count mismatch: sent {}, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(CapabilityError::Fatal(format!(
            "embedding dims mismatch: expected {}, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(vectors)
}

/// Create the configured [`Embedder`].
///
/// # Errors
///
/// Returns an error for unknown provider names or if a remote provider
/// cannot be initialized (missing config or API key).
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
