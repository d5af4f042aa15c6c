//! Core data models shared by the stores, the workflow engine, and the
//! pipelines.
//!
//! Entity ids are derived deterministically from the repository, the entity
//! kind, and a kind-specific key (see [`entity_key`]), so re-ingesting
//! unchanged content overwrites records instead of duplicating them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Entity ids are lowercase hex strings.
pub type EntityId = String;

/// The closed set of entity kinds held in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    Module,
    Class,
    Function,
    DocChunk,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::File,
        EntityKind::Module,
        EntityKind::Class,
        EntityKind::Function,
        EntityKind::DocChunk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::File => "file",
            EntityKind::Module => "module",
            EntityKind::Class => "class",
            EntityKind::Function => "function",
            EntityKind::DocChunk => "doc_chunk",
        }
    }

    /// Kinds that carry source code and get annotated with a summary.
    pub fn is_annotatable(&self) -> bool {
        matches!(self, EntityKind::Class | EntityKind::Function)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

/// Typed, directed relationship kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Contains,
    Defines,
    Calls,
    Imports,
    Documents,
}

impl RelationKind {
    pub const ALL: [RelationKind; 5] = [
        RelationKind::Contains,
        RelationKind::Defines,
        RelationKind::Calls,
        RelationKind::Imports,
        RelationKind::Documents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Contains => "contains",
            RelationKind::Defines => "defines",
            RelationKind::Calls => "calls",
            RelationKind::Imports => "imports",
            RelationKind::Documents => "documents",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity lives: a repository-relative path and an optional,
/// 1-based inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub lines: Option<(u32, u32)>,
}

impl Location {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lines: None,
        }
    }

    pub fn span(path: impl Into<String>, start: u32, end: u32) -> Self {
        Self {
            path: path.into(),
            lines: Some((start, end.max(start))),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lines {
            Some((start, end)) if start == end => write!(f, "{}:{}", self.path, start),
            Some((start, end)) => write!(f, "{}:{}-{}", self.path, start, end),
            None => f.write_str(&self.path),
        }
    }
}

/// A catalog record. The catalog is the only store holding these
/// attributes; the graph and the vector index refer to entities by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub repository: String,
    pub kind: EntityKind,
    pub name: String,
    pub location: Location,
    pub summary: Option<String>,
    /// Source text for code entities, chunk text for doc chunks.
    pub body: String,
    /// False until every embedding of the entity's last logical write landed.
    pub embedded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Build a fresh entity whose id is derived from `(repository, kind, key)`.
    pub fn new(
        repository: &str,
        kind: EntityKind,
        key: &str,
        name: impl Into<String>,
        location: Location,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: entity_id(repository, kind, key),
            repository: repository.to_string(),
            kind,
            name: name.into(),
            location,
            summary: None,
            body: String::new(),
            embedded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Short text used in prompts and fallback answers: the summary when
    /// present, otherwise the head of the body.
    pub fn snippet(&self, max_chars: usize) -> String {
        match &self.summary {
            Some(s) if !s.trim().is_empty() => s.clone(),
            _ => self.body.chars().take(max_chars).collect(),
        }
    }
}

/// Key component of an entity id.
///
/// Files are keyed by path and doc chunks by `path#byte_offset`. Everything
/// else is keyed by `path::qualified_name`, except when `path` is empty:
/// entities outside the repository (an imported crate, say) are keyed by
/// their qualified name alone so imports from several files meet at one id.
pub fn entity_key(kind: EntityKind, path: &str, qualified_name: &str) -> String {
    match kind {
        EntityKind::File => path.to_string(),
        EntityKind::DocChunk => format!("{}#{}", path, qualified_name),
        _ if path.is_empty() => qualified_name.to_string(),
        _ => format!("{}::{}", path, qualified_name),
    }
}

/// Deterministic entity id: SHA-256 over repository, kind, and key.
pub fn entity_id(repository: &str, kind: EntityKind, key: &str) -> EntityId {
    let mut hasher = Sha256::new();
    hasher.update(repository.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// A typed directed edge. Edges form a set: writing the same triple twice
/// stores it once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: EntityId,
    pub target_id: EntityId,
    pub kind: RelationKind,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: RelationKind,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
        }
    }
}

/// Which text of an entity a vector was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Body,
    Summary,
    Chunk,
}

/// A vector keyed by `(entity_id, facet)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub entity_id: EntityId,
    pub facet: Facet,
    pub vector: Vec<f32>,
    pub source_text: String,
    pub written_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(
        entity_id: impl Into<String>,
        facet: Facet,
        vector: Vec<f32>,
        source_text: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            facet,
            vector,
            source_text: source_text.into(),
            written_at: Utc::now(),
        }
    }
}

/// A file produced by the scanner: repository-relative path plus content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlob {
    pub repository: String,
    pub path: String,
    pub content: String,
}

impl FileBlob {
    pub fn new(
        repository: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            path: path.into(),
            content: content.into(),
        }
    }

    /// Lowercased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        path_extension(&self.path)
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Lowercased extension of the last path segment. Dotfiles such as
/// `.gitignore` have none.
pub fn path_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_deterministic() {
        let a = entity_id("repo", EntityKind::Function, "src/lib.rs::f");
        let b = entity_id("repo", EntityKind::Function, "src/lib.rs::f");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_entity_id_separates_kind_and_repository() {
        let f = entity_id("repo", EntityKind::Function, "x");
        let c = entity_id("repo", EntityKind::Class, "x");
        let other = entity_id("other", EntityKind::Function, "x");
        assert_ne!(f, c);
        assert_ne!(f, other);
    }

    #[test]
    fn test_entity_key_by_kind() {
        assert_eq!(entity_key(EntityKind::File, "a.rs", ""), "a.rs");
        assert_eq!(entity_key(EntityKind::Module, "", "serde"), "serde");
        assert_eq!(entity_key(EntityKind::Module, "a.rs", "tests"), "a.rs::tests");
        assert_eq!(entity_key(EntityKind::Function, "a.rs", "S::f"), "a.rs::S::f");
        assert_eq!(entity_key(EntityKind::DocChunk, "README.md", "120"), "README.md#120");
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::file("a.rs").to_string(), "a.rs");
        assert_eq!(Location::span("a.rs", 3, 3).to_string(), "a.rs:3");
        assert_eq!(Location::span("a.rs", 3, 9).to_string(), "a.rs:3-9");
    }

    #[test]
    fn test_blob_extension() {
        assert_eq!(FileBlob::new("r", "src/Main.RS", "").extension().as_deref(), Some("rs"));
        assert_eq!(FileBlob::new("r", "docs/.hidden", "").extension(), None);
        assert_eq!(FileBlob::new("r", "Makefile", "").extension(), None);
    }

    #[test]
    fn test_snippet_prefers_summary() {
        let mut e = Entity::new("r", EntityKind::Function, "k", "f", Location::file("a.rs"))
            .with_body("fn f() { g() }");
        assert_eq!(e.snippet(4), "fn f");
        e.summary = Some("Calls g.".to_string());
        assert_eq!(e.snippet(4), "Calls g.");
    }
}
