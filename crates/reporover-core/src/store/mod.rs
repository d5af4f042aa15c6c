//! Storage abstraction for the three coordinated stores.
//!
//! Each store is keyed independently and knows nothing about the others:
//!
//! | Trait | Key | Sole source of |
//! |-------|-----|----------------|
//! | [`EntityCatalog`] | entity id | human-readable attributes |
//! | [`RelationshipGraph`] | `(source, target, kind)` | structural edges |
//! | [`VectorIndex`] | `(entity_id, facet)` | similarity scores |
//!
//! Cross-store invariants (no edge or vector without a catalog record) are
//! enforced one level up, in [`SemanticMemory`](crate::memory::SemanticMemory),
//! which is the only writer. All writes are overwrite-by-key; removals
//! report how much they dropped.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::MemoryResult;
use crate::models::{EmbeddingRecord, Entity, EntityKind, Facet, RelationKind, Relationship};

/// A vector search result before it is joined with the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub entity_id: String,
    pub facet: Facet,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Structured record store keyed by entity id.
///
/// # Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | `put` | Insert or overwrite a record |
/// | `get` | Fetch one record |
/// | `contains` | Existence check used for referential integrity |
/// | `list` | All records of a repository, ordered by id |
/// | `by_kind` | Records of one kind in a repository |
/// | `by_name` | Records whose simple name matches exactly |
/// | `set_embedded` | Flip the `embedded` flag and stamp `updated_at` |
/// | `remove` | Drop a record, returning it |
#[async_trait]
pub trait EntityCatalog: Send + Sync {
    async fn put(&self, entity: Entity) -> MemoryResult<()>;
    async fn get(&self, id: &str) -> MemoryResult<Option<Entity>>;
    async fn contains(&self, id: &str) -> MemoryResult<bool>;
    async fn list(&self, repository: &str) -> MemoryResult<Vec<Entity>>;
    async fn by_kind(&self, repository: &str, kind: EntityKind) -> MemoryResult<Vec<Entity>>;
    async fn by_name(&self, repository: &str, name: &str) -> MemoryResult<Vec<Entity>>;
    async fn set_embedded(&self, id: &str, embedded: bool) -> MemoryResult<()>;
    async fn remove(&self, id: &str) -> MemoryResult<Option<Entity>>;
    async fn len(&self) -> MemoryResult<usize>;
}

/// Directed multigraph over entity ids with typed edges. Edges form a set.
#[async_trait]
pub trait RelationshipGraph: Send + Sync {
    /// Returns `true` when the edge was new.
    async fn add_edge(&self, rel: Relationship) -> MemoryResult<bool>;
    /// Edges leaving `id`, optionally filtered to `kinds` (empty = all).
    async fn outgoing(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<Vec<Relationship>>;
    /// Edges arriving at `id`, optionally filtered to `kinds` (empty = all).
    async fn incoming(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<Vec<Relationship>>;
    /// Every edge, in sorted order.
    async fn edges(&self) -> MemoryResult<Vec<Relationship>>;
    /// Drop edges leaving `id`, optionally filtered to `kinds` (empty = all).
    async fn remove_edges_from(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<usize>;
    /// Drop every edge with `id` at either end.
    async fn remove_node(&self, id: &str) -> MemoryResult<usize>;
    async fn edge_count(&self) -> MemoryResult<usize>;
}

/// Nearest-neighbor index over embedding records keyed by `(entity_id, facet)`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, record: EmbeddingRecord) -> MemoryResult<()>;
    /// Top `limit` records by cosine similarity, highest first.
    async fn search(&self, query: &[f32], limit: usize) -> MemoryResult<Vec<VectorHit>>;
    async fn records_for(&self, entity_id: &str) -> MemoryResult<Vec<EmbeddingRecord>>;
    /// Drop the records of `entity_id` for `facets` (empty = all facets).
    async fn remove(&self, entity_id: &str, facets: &[Facet]) -> MemoryResult<usize>;
    /// All `(entity_id, facet)` keys, sorted.
    async fn keys(&self) -> MemoryResult<Vec<(String, Facet)>>;
    async fn len(&self) -> MemoryResult<usize>;
}
