//! Semantic memory facade.
//!
//! [`SemanticMemory`] is the only writer of the entity catalog, the
//! relationship graph, and the vector index. It keeps them consistent:
//!
//! - an edge is stored only if both endpoints exist in the catalog
//!   ([`MemoryError::DanglingEdge`] otherwise);
//! - an embedding is stored only if its entity exists
//!   ([`MemoryError::UnknownEntity`] otherwise);
//! - a unit write ([`SemanticMemory::upsert_unit`]) lands the catalog record
//!   first and flips `embedded` only after every vector landed;
//! - removing an entity drops its edges and vectors before the record.
//!
//! Writes are serialized per entity id through a keyed async lock map, so
//! writes to different ids proceed concurrently. An edge write holds the
//! locks of both endpoints, taken in id order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};
use crate::models::{
    EmbeddingRecord, Entity, EntityId, EntityKind, Facet, RelationKind, Relationship,
};
use crate::store::memory::{InMemoryCatalog, InMemoryGraph, InMemoryVectorIndex};
use crate::store::{EntityCatalog, RelationshipGraph, VectorIndex};

/// Smallest candidate pool pulled from the vector index per similarity search.
const MIN_CANDIDATE_POOL: usize = 64;

/// One vector to write as part of a unit.
#[derive(Debug, Clone)]
pub struct UnitEmbedding {
    pub facet: Facet,
    pub text: String,
    pub vector: Vec<f32>,
}

impl UnitEmbedding {
    pub fn new(facet: Facet, text: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            facet,
            text: text.into(),
            vector,
        }
    }
}

/// Result of [`SemanticMemory::upsert_unit`].
#[derive(Debug)]
pub struct UnitOutcome {
    pub id: EntityId,
    pub embeddings_written: usize,
    /// The first embedding write that failed. The catalog record is kept
    /// with `embedded = false`; retrying the unit is idempotent.
    pub embedding_error: Option<MemoryError>,
}

impl UnitOutcome {
    pub fn is_complete(&self) -> bool {
        self.embedding_error.is_none()
    }
}

/// Per-repository counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub entities: BTreeMap<EntityKind, usize>,
    pub relationships: usize,
    pub embeddings: usize,
}

impl MemoryStats {
    pub fn entity_count(&self) -> usize {
        self.entities.values().sum()
    }
}

/// What [`SemanticMemory::sweep`] dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub entities_removed: usize,
    pub edges_cleared: usize,
}

pub struct SemanticMemory {
    catalog: Arc<dyn EntityCatalog>,
    graph: Arc<dyn RelationshipGraph>,
    vectors: Arc<dyn VectorIndex>,
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl SemanticMemory {
    pub fn new(
        catalog: Arc<dyn EntityCatalog>,
        graph: Arc<dyn RelationshipGraph>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            catalog,
            graph,
            vectors,
            locks: DashMap::new(),
        }
    }

    /// Facade over the in-process stores.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCatalog::new()),
            Arc::new(InMemoryGraph::new()),
            Arc::new(InMemoryVectorIndex::new()),
        )
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    async fn lock_pair(
        &self,
        a: &str,
        b: &str,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }

    // ============ Writes ============

    /// Insert or overwrite an entity. Caller must hold the entity lock.
    ///
    /// On overwrite `created_at` is preserved. When the body is unchanged the
    /// stored summary (unless replaced) and the `embedded` flag carry over;
    /// a changed body resets both and drops the summary vector.
    async fn put_merged(&self, mut entity: Entity) -> MemoryResult<EntityId> {
        let now = Utc::now();
        if let Some(prev) = self.catalog.get(&entity.id).await? {
            entity.created_at = prev.created_at;
            let same_body = prev.body == entity.body;
            if same_body && entity.summary.is_none() {
                entity.summary = prev.summary;
            }
            if !same_body {
                self.vectors.remove(&entity.id, &[Facet::Summary]).await?;
            }
            entity.embedded = same_body && prev.embedded;
        } else {
            entity.created_at = now;
        }
        entity.updated_at = now;
        let id = entity.id.clone();
        debug!(id = %id, kind = %entity.kind, name = %entity.name, "upsert entity");
        self.catalog.put(entity).await?;
        Ok(id)
    }

    pub async fn upsert_entity(&self, entity: Entity) -> MemoryResult<EntityId> {
        let _guard = self.lock(&entity.id).await;
        self.put_merged(entity).await
    }

    /// Store an edge. Returns `true` when the edge was new.
    pub async fn upsert_relationship(&self, rel: Relationship) -> MemoryResult<bool> {
        let _guards = self.lock_pair(&rel.source_id, &rel.target_id).await;
        for endpoint in [&rel.source_id, &rel.target_id] {
            if !self.catalog.contains(endpoint).await? {
                return Err(MemoryError::DanglingEdge {
                    source_id: rel.source_id.clone(),
                    target_id: rel.target_id.clone(),
                    kind: rel.kind,
                    missing: endpoint.clone(),
                });
            }
        }
        self.graph.add_edge(rel).await
    }

    pub async fn upsert_embedding(&self, record: EmbeddingRecord) -> MemoryResult<()> {
        let id = record.entity_id.clone();
        let _guard = self.lock(&id).await;
        if !self.catalog.contains(&id).await? {
            return Err(MemoryError::UnknownEntity(id));
        }
        self.vectors.upsert(record).await?;
        self.catalog.set_embedded(&id, true).await
    }

    /// Write one entity and its embeddings as a logical unit.
    ///
    /// The catalog record is written first with `embedded = false`, then each
    /// embedding. The flag is set only when at least one embedding was given
    /// and all of them landed.
    pub async fn upsert_unit(
        &self,
        entity: Entity,
        embeddings: Vec<UnitEmbedding>,
    ) -> MemoryResult<UnitOutcome> {
        let _guard = self.lock(&entity.id).await;
        let id = self.put_merged(entity).await?;
        self.catalog.set_embedded(&id, false).await?;

        let expected = embeddings.len();
        let mut written = 0;
        let mut embedding_error = None;
        for emb in embeddings {
            let record = EmbeddingRecord::new(id.clone(), emb.facet, emb.vector, emb.text);
            match self.vectors.upsert(record).await {
                Ok(()) => written += 1,
                Err(e) => {
                    embedding_error = Some(e);
                    break;
                }
            }
        }

        if expected > 0 && written == expected {
            self.catalog.set_embedded(&id, true).await?;
        }
        Ok(UnitOutcome {
            id,
            embeddings_written: written,
            embedding_error,
        })
    }

    // ============ Removal ============

    /// Remove an entity together with every edge touching it and all of its
    /// vectors. Returns `false` when the id was unknown.
    pub async fn remove_entity(&self, id: &str) -> MemoryResult<bool> {
        let _guard = self.lock(id).await;
        let edges = self.graph.remove_node(id).await?;
        let vectors = self.vectors.remove(id, &[]).await?;
        let removed = self.catalog.remove(id).await?.is_some();
        debug!(id, edges, vectors, removed, "remove entity");
        Ok(removed)
    }

    /// Drop the edges leaving `id`, optionally only those of `kinds`.
    pub async fn remove_outgoing(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<usize> {
        let _guard = self.lock(id).await;
        self.graph.remove_edges_from(id, kinds).await
    }

    /// Reconcile the entities of `repository` selected by `in_scope` with a
    /// fresh extraction whose ids are `keep`.
    ///
    /// In-scope entities missing from `keep` are removed with their edges and
    /// vectors. In-scope entities that stay lose their outgoing edges, so the
    /// caller writes the current set afterwards.
    pub async fn sweep<F>(
        &self,
        repository: &str,
        keep: &HashSet<EntityId>,
        in_scope: F,
    ) -> MemoryResult<SweepReport>
    where
        F: Fn(&Entity) -> bool,
    {
        let (kept, stale): (Vec<Entity>, Vec<Entity>) = self
            .catalog
            .list(repository)
            .await?
            .into_iter()
            .filter(|e| in_scope(e))
            .partition(|e| keep.contains(&e.id));

        let mut report = SweepReport::default();
        for entity in &stale {
            if self.remove_entity(&entity.id).await? {
                report.entities_removed += 1;
            }
        }
        for entity in &kept {
            report.edges_cleared += self.remove_outgoing(&entity.id, &[]).await?;
        }
        Ok(report)
    }

    // ============ Reads ============

    pub async fn get_entity(&self, id: &str) -> MemoryResult<Entity> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    pub async fn entities_by_kind(
        &self,
        repository: &str,
        kind: EntityKind,
    ) -> MemoryResult<Vec<Entity>> {
        self.catalog.by_kind(repository, kind).await
    }

    pub async fn find_by_name(&self, repository: &str, name: &str) -> MemoryResult<Vec<Entity>> {
        self.catalog.by_name(repository, name).await
    }

    pub async fn entities(&self, repository: &str) -> MemoryResult<Vec<Entity>> {
        self.catalog.list(repository).await
    }

    /// Entities whose last write has not been fully embedded.
    pub async fn unembedded(&self, repository: &str) -> MemoryResult<Vec<Entity>> {
        Ok(self
            .catalog
            .list(repository)
            .await?
            .into_iter()
            .filter(|e| !e.embedded)
            .collect())
    }

    pub async fn outgoing(
        &self,
        id: &str,
        kinds: &[RelationKind],
    ) -> MemoryResult<Vec<Relationship>> {
        self.graph.outgoing(id, kinds).await
    }

    pub async fn incoming(
        &self,
        id: &str,
        kinds: &[RelationKind],
    ) -> MemoryResult<Vec<Relationship>> {
        self.graph.incoming(id, kinds).await
    }

    /// Edges whose source belongs to `repository`, sorted.
    pub async fn relationships(&self, repository: &str) -> MemoryResult<Vec<Relationship>> {
        let ids = self.repository_ids(repository).await?;
        Ok(self
            .graph
            .edges()
            .await?
            .into_iter()
            .filter(|r| ids.contains(&r.source_id))
            .collect())
    }

    /// Vector keys of entities in `repository`, sorted.
    pub async fn embedding_keys(&self, repository: &str) -> MemoryResult<Vec<(EntityId, Facet)>> {
        let ids = self.repository_ids(repository).await?;
        Ok(self
            .vectors
            .keys()
            .await?
            .into_iter()
            .filter(|(id, _)| ids.contains(id))
            .collect())
    }

    pub async fn embeddings_for(&self, id: &str) -> MemoryResult<Vec<EmbeddingRecord>> {
        self.vectors.records_for(id).await
    }

    async fn repository_ids(&self, repository: &str) -> MemoryResult<HashSet<EntityId>> {
        Ok(self
            .catalog
            .list(repository)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect())
    }

    /// Breadth-first walk from `seeds` following edges of `kinds` (empty =
    /// all) in both directions, up to `max_depth` hops.
    ///
    /// Returns each reached entity once, with the hop count at which it was
    /// first reached, ordered by depth then id. Seeds are excluded.
    pub async fn traverse(
        &self,
        seeds: &[EntityId],
        kinds: &[RelationKind],
        max_depth: usize,
    ) -> MemoryResult<Vec<(Entity, usize)>> {
        let mut visited: HashSet<EntityId> = seeds.iter().cloned().collect();
        let mut frontier: BTreeSet<EntityId> = seeds.iter().cloned().collect();
        let mut out = Vec::new();

        for depth in 1..=max_depth {
            let mut next = BTreeSet::new();
            for id in &frontier {
                let outgoing = self.graph.outgoing(id, kinds).await?;
                let incoming = self.graph.incoming(id, kinds).await?;
                let neighbors = outgoing
                    .into_iter()
                    .map(|r| r.target_id)
                    .chain(incoming.into_iter().map(|r| r.source_id));
                for n in neighbors {
                    if visited.insert(n.clone()) {
                        next.insert(n);
                    }
                }
            }
            for id in &next {
                if let Some(entity) = self.catalog.get(id).await? {
                    out.push((entity, depth));
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(out)
    }

    /// Top `k` entities by cosine similarity, best facet score per entity,
    /// optionally restricted to one repository.
    ///
    /// Pulls a candidate pool of `max(8k, 64)` vectors and widens it while a
    /// repository filter leaves fewer than `k` entities.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        repository: Option<&str>,
    ) -> MemoryResult<Vec<(Entity, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let total = self.vectors.len().await?;
        let mut pool = (k * 8).max(MIN_CANDIDATE_POOL);

        loop {
            let hits = self.vectors.search(query, pool).await?;
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for hit in hits {
                if !seen.insert(hit.entity_id.clone()) {
                    continue;
                }
                let Some(entity) = self.catalog.get(&hit.entity_id).await? else {
                    continue;
                };
                if repository.is_some_and(|r| r != entity.repository) {
                    continue;
                }
                out.push((entity, hit.score));
                if out.len() == k {
                    break;
                }
            }
            if out.len() == k || pool >= total {
                return Ok(out);
            }
            pool *= 2;
        }
    }

    pub async fn stats(&self, repository: &str) -> MemoryResult<MemoryStats> {
        let entities = self.catalog.list(repository).await?;
        let mut stats = MemoryStats::default();
        for e in &entities {
            *stats.entities.entry(e.kind).or_insert(0) += 1;
        }
        stats.relationships = self.relationships(repository).await?.len();
        stats.embeddings = self.embedding_keys(repository).await?.len();
        Ok(stats)
    }

    /// Every edge endpoint and vector key without a catalog record. Empty
    /// when the stores are consistent.
    pub async fn check_integrity(&self) -> MemoryResult<Vec<String>> {
        let mut violations = Vec::new();
        for rel in self.graph.edges().await? {
            for endpoint in [&rel.source_id, &rel.target_id] {
                if !self.catalog.contains(endpoint).await? {
                    violations.push(format!("edge endpoint {} missing", endpoint));
                }
            }
        }
        for (id, facet) in self.vectors.keys().await? {
            if !self.catalog.contains(&id).await? {
                violations.push(format!("vector ({}, {:?}) has no entity", id, facet));
            }
        }
        Ok(violations)
    }
}
