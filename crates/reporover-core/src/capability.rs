//! Capability traits for the external collaborators.
//!
//! The pipelines never touch the file system, a parser library, or a model
//! provider directly. They call these traits, and the application wires in
//! concrete implementations:
//!
//! | Trait | Role | App implementation |
//! |-------|------|--------------------|
//! | [`Scanner`] | repository reference → file blobs | walkdir/globset scanner with git clone |
//! | [`SourceParser`] | one source file → raw entities and relations | `syn` visitor for Rust |
//! | [`Embedder`] | texts → vectors | hash, OpenAI, Ollama |
//! | [`Generator`] | prompt → text | OpenAI, Ollama, disabled |
//! | [`EpisodicMemory`] | append-only interaction log | SQLite `interactions` table |
//! | [`CoreMemory`] | persona read contract | JSON file |
//!
//! Provider calls return [`CapabilityError`], which is either `Transient`
//! (retried by [`retry`](crate::retry)) or `Fatal`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CapabilityError, ParseError};
use crate::ingest::IngestOptions;
use crate::memory::SemanticMemory;
use crate::models::{EntityKind, FileBlob, RelationKind};
use crate::query::QueryOptions;

/// Resolves a repository reference and yields its files.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, repository: &str) -> Result<ScanOutput, CapabilityError>;
}

/// Files a scan read, plus the files it had to skip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutput {
    pub files: Vec<FileBlob>,
    /// One `"<path>: <reason>"` line per skipped file.
    pub warnings: Vec<String>,
}

impl ScanOutput {
    pub fn new(files: Vec<FileBlob>) -> Self {
        Self {
            files,
            warnings: Vec::new(),
        }
    }
}

/// Turns one source file into raw entities and relations.
///
/// Parsing is synchronous and CPU-bound; the ingestion step runs it on the
/// blocking pool.
pub trait SourceParser: Send + Sync {
    /// Whether this parser understands the file at `path`.
    fn handles(&self, path: &str) -> bool;
    fn parse(&self, file: &FileBlob) -> Result<ParsedFile, ParseError>;
}

/// Embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts. The output has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;
}

/// Text generation model used for summaries and answers.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError>;
}

/// Append-only log of interactions.
#[async_trait]
pub trait EpisodicMemory: Send + Sync {
    async fn append(&self, interaction: Interaction) -> Result<(), CapabilityError>;
    /// The most recent `limit` interactions, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Interaction>, CapabilityError>;
}

/// Read contract for the agent persona.
pub trait CoreMemory: Send + Sync {
    fn persona(&self) -> Persona;
}

// ============ Parser output ============

/// Everything the parser extracted from one file.
///
/// References are by kind and qualified name; the ingestion step resolves
/// them to entity ids using the file's path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub entities: Vec<RawEntity>,
    pub relations: Vec<RawRelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub kind: EntityKind,
    /// Simple name, e.g. `parse`.
    pub name: String,
    /// Name qualified within the file, e.g. `Parser::parse`.
    pub qualified_name: String,
    pub lines: Option<(u32, u32)>,
    pub body: String,
    /// Lives outside the repository (an imported crate or module).
    #[serde(default)]
    pub external: bool,
}

impl RawEntity {
    pub fn new(kind: EntityKind, qualified_name: impl Into<String>) -> Self {
        let qualified_name = qualified_name.into();
        let name = qualified_name
            .rsplit("::")
            .next()
            .unwrap_or(&qualified_name)
            .to_string();
        Self {
            kind,
            name,
            qualified_name,
            lines: None,
            body: String::new(),
            external: false,
        }
    }

    pub fn lines(mut self, start: u32, end: u32) -> Self {
        self.lines = Some((start, end));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Top-level items get a `defines` edge from their file.
    pub fn is_top_level(&self) -> bool {
        !self.external && !self.qualified_name.contains("::")
    }

    pub fn reference(&self) -> RawRef {
        RawRef {
            kind: self.kind,
            qualified_name: self.qualified_name.clone(),
            external: self.external,
        }
    }
}

/// Pointer to an entity of the same file (or an external one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRef {
    pub kind: EntityKind,
    pub qualified_name: String,
    #[serde(default)]
    pub external: bool,
}

impl RawRef {
    /// The file being parsed.
    pub fn file() -> Self {
        Self {
            kind: EntityKind::File,
            qualified_name: String::new(),
            external: false,
        }
    }

    pub fn local(kind: EntityKind, qualified_name: impl Into<String>) -> Self {
        Self {
            kind,
            qualified_name: qualified_name.into(),
            external: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRelation {
    pub source: RawRef,
    pub target: RawRef,
    pub kind: RelationKind,
}

impl RawRelation {
    pub fn new(source: RawRef, target: RawRef, kind: RelationKind) -> Self {
        Self {
            source,
            target,
            kind,
        }
    }
}

// ============ Memories ============

/// The agent's persona, read from core memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub instructions: Vec<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "RepoRover".to_string(),
            description: "A meticulous software analyst that explains code repositories \
                          using evidence gathered from their source and documentation."
                .to_string(),
            instructions: vec![
                "Answer only from the provided context.".to_string(),
                "Cite the entities you rely on by name and location.".to_string(),
                "Say so plainly when the context does not contain the answer.".to_string(),
            ],
        }
    }
}

/// Core memory holding a fixed persona.
#[derive(Debug, Clone, Default)]
pub struct StaticCoreMemory(pub Persona);

impl CoreMemory for StaticCoreMemory {
    fn persona(&self) -> Persona {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Question,
    Answer,
    Note,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Question => "question",
            InteractionKind::Answer => "answer",
            InteractionKind::Note => "note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "question" => Some(InteractionKind::Question),
            "answer" => Some(InteractionKind::Answer),
            "note" => Some(InteractionKind::Note),
            _ => None,
        }
    }
}

/// One entry in episodic memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: DateTime<Utc>,
    /// Who produced the entry: `user`, `synthesizer`, `ingestion`.
    pub agent: String,
    pub kind: InteractionKind,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Interaction {
    pub fn new(
        agent: impl Into<String>,
        kind: InteractionKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.into(),
            kind,
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Question/answer turns, as opposed to operational notes.
    pub fn is_turn(&self) -> bool {
        matches!(self.kind, InteractionKind::Question | InteractionKind::Answer)
    }
}

/// Episodic memory kept in a vector. Used by tests and when no database is
/// configured.
#[derive(Debug, Default)]
pub struct InMemoryEpisodic {
    entries: Mutex<Vec<Interaction>>,
}

impl InMemoryEpisodic {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EpisodicMemory for InMemoryEpisodic {
    async fn append(&self, interaction: Interaction) -> Result<(), CapabilityError> {
        self.entries
            .lock()
            .map_err(|_| CapabilityError::Fatal("episodic memory lock poisoned".to_string()))?
            .push(interaction);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Interaction>, CapabilityError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CapabilityError::Fatal("episodic memory lock poisoned".to_string()))?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }
}

// ============ Wiring ============

/// Everything the pipelines need, bundled for the step dispatcher.
#[derive(Clone)]
pub struct Capabilities {
    pub memory: Arc<SemanticMemory>,
    pub scanner: Arc<dyn Scanner>,
    pub parser: Arc<dyn SourceParser>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub episodic: Arc<dyn EpisodicMemory>,
    pub core: Arc<dyn CoreMemory>,
    pub ingest: IngestOptions,
    pub query: QueryOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_entity_name_from_qualified() {
        let e = RawEntity::new(EntityKind::Function, "Parser::parse");
        assert_eq!(e.name, "parse");
        assert!(!e.is_top_level());
        assert!(RawEntity::new(EntityKind::Function, "main").is_top_level());
        assert!(!RawEntity::new(EntityKind::Module, "serde").external().is_top_level());
    }

    #[test]
    fn test_default_persona() {
        let p = StaticCoreMemory::default().persona();
        assert_eq!(p.name, "RepoRover");
        assert!(!p.instructions.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_episodic_recent() {
        let mem = InMemoryEpisodic::new();
        for i in 0..5 {
            mem.append(Interaction::new("user", InteractionKind::Question, format!("q{}", i)))
                .await
                .unwrap();
        }
        let recent = mem.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "q3");
        assert_eq!(recent[1].content, "q4");
        assert_eq!(mem.recent(10).await.unwrap().len(), 5);
    }

    #[test]
    fn test_interaction_kind_parse() {
        for kind in [InteractionKind::Question, InteractionKind::Answer, InteractionKind::Note] {
            assert_eq!(InteractionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(InteractionKind::parse("shout"), None);
    }
}
