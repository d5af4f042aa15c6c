//! TOML configuration.
//!
//! Every section except `[db]` may be omitted; missing values fall back to
//! the defaults below. [`load_config`] rejects values the pipelines cannot
//! work with before anything touches the disk or the network.
//!
//! ```toml
//! [db]
//! path = "./data/rover.sqlite"
//!
//! [scan]
//! workspace_dir = "./data/workspace"
//! exclude_globs = ["**/vendor/**"]
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.1"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use reporover_core::chunk::ChunkPolicy;
use reporover_core::ingest::IngestOptions;
use reporover_core::query::{
    default_architecture_keywords, default_relational_keywords, QueryOptions,
};
use reporover_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub annotate: AnnotateConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Where remote repositories are cloned.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Extensions (without the dot) treated as documentation.
    #[serde(default = "default_doc_extensions")]
    pub doc_extensions: Vec<String>,
    /// Larger files are skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            doc_extensions: default_doc_extensions(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./data/workspace")
}
fn default_include_globs() -> Vec<String> {
    ["**/*.rs", "**/*.md", "**/*.markdown", "**/*.rst", "**/*.txt", "**/*.adoc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_doc_extensions() -> Vec<String> {
    IngestOptions::default().doc_extensions
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Stop the ingestion on the first summary that cannot be generated.
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            fail_fast: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_evidence")]
    pub max_evidence: usize,
    #[serde(default)]
    pub always_traverse_depth: usize,
    #[serde(default = "default_relational_depth")]
    pub relational_depth: usize,
    #[serde(default = "default_traversal_decay")]
    pub traversal_decay: f32,
    #[serde(default = "default_traverse_seeds")]
    pub traverse_seeds: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_relational_keywords")]
    pub relational_keywords: Vec<String>,
    #[serde(default = "default_architecture_keywords")]
    pub architecture_keywords: Vec<String>,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_evidence: default_max_evidence(),
            always_traverse_depth: 0,
            relational_depth: default_relational_depth(),
            traversal_decay: default_traversal_decay(),
            traverse_seeds: default_traverse_seeds(),
            history_turns: default_history_turns(),
            relational_keywords: default_relational_keywords(),
            architecture_keywords: default_architecture_keywords(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_max_evidence() -> usize {
    12
}
fn default_relational_depth() -> usize {
    1
}
fn default_traversal_decay() -> f32 {
    0.5
}
fn default_traverse_seeds() -> usize {
    3
}
fn default_history_turns() -> usize {
    6
}
fn default_snippet_chars() -> usize {
    400
}

fn lowercased(words: &[String]) -> Vec<String> {
    words.iter().map(|w| w.to_lowercase()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL; defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `openai`, or `ollama`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersonaConfig {
    /// Core memory JSON file. Without one the built-in persona is used.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl EmbeddingConfig {
    pub fn is_remote(&self) -> bool {
        self.provider != "hash"
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Defaults everywhere, with the database at `./data/rover.sqlite`.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/rover.sqlite"),
            },
            scan: ScanConfig::default(),
            chunking: ChunkingConfig::default(),
            annotate: AnnotateConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            persona: PersonaConfig::default(),
            server: ServerConfig::default(),
        }
    }

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            chunking: ChunkPolicy {
                max_chars: self.chunking.max_chars,
                overlap_chars: self.chunking.overlap_chars,
            },
            // Summaries need a generator.
            annotate: self.annotate.enabled && self.generation.is_enabled(),
            annotate_concurrency: self.annotate.concurrency,
            fail_fast: self.annotate.fail_fast,
            embed_batch_size: self.embedding.batch_size,
            retry: Self::retry(self.generation.max_retries.max(self.embedding.max_retries)),
            doc_extensions: self
                .scan
                .doc_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        let r = &self.retrieval;
        QueryOptions {
            top_k: r.top_k,
            max_evidence: r.max_evidence,
            always_traverse_depth: r.always_traverse_depth,
            relational_depth: r.relational_depth,
            traversal_decay: r.traversal_decay,
            traverse_seeds: r.traverse_seeds,
            history_turns: r.history_turns,
            relational_keywords: lowercased(&r.relational_keywords),
            architecture_keywords: lowercased(&r.architecture_keywords),
            snippet_chars: r.snippet_chars,
            retry: Self::retry(self.generation.max_retries),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    // Annotation
    if config.annotate.concurrency == 0 {
        bail!("annotate.concurrency must be >= 1");
    }

    // Retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_evidence == 0 {
        bail!("retrieval.max_evidence must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.traversal_decay) {
        bail!("retrieval.traversal_decay must be in [0.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.is_remote() {
        if config.embedding.dims.is_none() {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_only_db_is_required() {
        let config = parse("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.provider, "disabled");
        assert_eq!(config.retrieval.top_k, 8);
        assert!(config.annotate.fail_fast);
        assert!(parse("[scan]\n").is_err());
    }

    #[test]
    fn test_remote_embedding_needs_model_and_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\ndims = 768\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[generation]\nprovider = \"gpt\"\n").is_err());
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[chunking]\nmax_chars = 0\n").is_err());
        assert!(
            parse("[db]\npath = \"x\"\n[chunking]\nmax_chars = 100\noverlap_chars = 100\n")
                .is_err()
        );
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ntraversal_decay = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[annotate]\nconcurrency = 0\n").is_err());
    }

    #[test]
    fn test_options_mapping() {
        let config = parse(
            "[db]\npath = \"x\"\n[scan]\ndoc_extensions = [\".MD\"]\n\
             [retrieval]\nrelational_keywords = [\"Calls\"]\nalways_traverse_depth = 2\n\
             architecture_keywords = [\"Blueprint\"]\n",
        )
        .unwrap();
        let ingest = config.ingest_options();
        assert_eq!(ingest.doc_extensions, vec!["md".to_string()]);
        assert!(!ingest.annotate, "no generator configured");
        let query = config.query_options();
        assert_eq!(query.relational_keywords, vec!["calls".to_string()]);
        assert_eq!(query.always_traverse_depth, 2);
        assert_eq!(query.architecture_keywords, vec!["blueprint".to_string()]);
        assert_eq!(
            Config::minimal().query_options().architecture_keywords,
            default_architecture_keywords()
        );
    }

    #[test]
    fn test_minimal_is_valid() {
        validate(&Config::minimal()).unwrap();
    }
}
