//! In-process implementations of the three stores.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Locks are never
//! held across an `.await`. Vector search is brute-force cosine similarity
//! over all stored vectors.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::embedding::cosine_similarity;
use crate::error::{MemoryError, MemoryResult};
use crate::models::{EmbeddingRecord, Entity, EntityKind, Facet, RelationKind, Relationship};

use super::{EntityCatalog, RelationshipGraph, VectorHit, VectorIndex};

fn read<T>(lock: &RwLock<T>) -> MemoryResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| MemoryError::Store("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> MemoryResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| MemoryError::Store("lock poisoned".to_string()))
}

/// Catalog backed by a `HashMap<id, Entity>`.
#[derive(Default)]
pub struct InMemoryCatalog {
    entities: RwLock<HashMap<String, Entity>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted<F>(&self, filter: F) -> MemoryResult<Vec<Entity>>
    where
        F: Fn(&Entity) -> bool,
    {
        let map = read(&self.entities)?;
        let mut out: Vec<Entity> = map.values().filter(|e| filter(e)).cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

#[async_trait]
impl EntityCatalog for InMemoryCatalog {
    async fn put(&self, entity: Entity) -> MemoryResult<()> {
        write(&self.entities)?.insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn get(&self, id: &str) -> MemoryResult<Option<Entity>> {
        Ok(read(&self.entities)?.get(id).cloned())
    }

    async fn contains(&self, id: &str) -> MemoryResult<bool> {
        Ok(read(&self.entities)?.contains_key(id))
    }

    async fn list(&self, repository: &str) -> MemoryResult<Vec<Entity>> {
        self.collect_sorted(|e| e.repository == repository)
    }

    async fn by_kind(&self, repository: &str, kind: EntityKind) -> MemoryResult<Vec<Entity>> {
        self.collect_sorted(|e| e.repository == repository && e.kind == kind)
    }

    async fn by_name(&self, repository: &str, name: &str) -> MemoryResult<Vec<Entity>> {
        self.collect_sorted(|e| e.repository == repository && e.name == name)
    }

    async fn set_embedded(&self, id: &str, embedded: bool) -> MemoryResult<()> {
        let mut map = write(&self.entities)?;
        let entity = map
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        entity.embedded = embedded;
        entity.updated_at = Utc::now();
        Ok(())
    }

    async fn remove(&self, id: &str) -> MemoryResult<Option<Entity>> {
        Ok(write(&self.entities)?.remove(id))
    }

    async fn len(&self) -> MemoryResult<usize> {
        Ok(read(&self.entities)?.len())
    }
}

#[derive(Default)]
struct Adjacency {
    /// source → {(kind, target)}
    out: EdgeSets,
    /// target → {(kind, source)}
    inc: EdgeSets,
    count: usize,
}

/// Graph backed by forward and reverse adjacency sets.
#[derive(Default)]
pub struct InMemoryGraph {
    adj: RwLock<Adjacency>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

fn kind_allowed(kinds: &[RelationKind], kind: RelationKind) -> bool {
    kinds.is_empty() || kinds.contains(&kind)
}

type EdgeSets = HashMap<String, BTreeSet<(RelationKind, String)>>;

/// Remove `(kind, other)` from the set under `key`, dropping emptied sets.
fn unlink(sets: &mut EdgeSets, key: &str, kind: RelationKind, other: &str) {
    if let Some(set) = sets.get_mut(key) {
        set.remove(&(kind, other.to_string()));
        if set.is_empty() {
            sets.remove(key);
        }
    }
}

#[async_trait]
impl RelationshipGraph for InMemoryGraph {
    async fn add_edge(&self, rel: Relationship) -> MemoryResult<bool> {
        let mut adj = write(&self.adj)?;
        let inserted = adj
            .out
            .entry(rel.source_id.clone())
            .or_default()
            .insert((rel.kind, rel.target_id.clone()));
        if inserted {
            adj.inc
                .entry(rel.target_id)
                .or_default()
                .insert((rel.kind, rel.source_id));
            adj.count += 1;
        }
        Ok(inserted)
    }

    async fn outgoing(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<Vec<Relationship>> {
        let adj = read(&self.adj)?;
        Ok(adj
            .out
            .get(id)
            .into_iter()
            .flatten()
            .filter(|(k, _)| kind_allowed(kinds, *k))
            .map(|(k, target)| Relationship::new(id, target.clone(), *k))
            .collect())
    }

    async fn incoming(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<Vec<Relationship>> {
        let adj = read(&self.adj)?;
        Ok(adj
            .inc
            .get(id)
            .into_iter()
            .flatten()
            .filter(|(k, _)| kind_allowed(kinds, *k))
            .map(|(k, source)| Relationship::new(source.clone(), id, *k))
            .collect())
    }

    async fn edges(&self) -> MemoryResult<Vec<Relationship>> {
        let adj = read(&self.adj)?;
        let mut all: Vec<Relationship> = adj
            .out
            .iter()
            .flat_map(|(source, targets)| {
                targets
                    .iter()
                    .map(move |(k, target)| Relationship::new(source.clone(), target.clone(), *k))
            })
            .collect();
        all.sort();
        Ok(all)
    }

    async fn remove_edges_from(&self, id: &str, kinds: &[RelationKind]) -> MemoryResult<usize> {
        let mut guard = write(&self.adj)?;
        let adj = &mut *guard;
        let Some(targets) = adj.out.get_mut(id) else {
            return Ok(0);
        };
        let dropped: Vec<(RelationKind, String)> = targets
            .iter()
            .filter(|(k, _)| kind_allowed(kinds, *k))
            .cloned()
            .collect();
        for edge in &dropped {
            targets.remove(edge);
        }
        if targets.is_empty() {
            adj.out.remove(id);
        }
        for (kind, target) in &dropped {
            unlink(&mut adj.inc, target, *kind, id);
        }
        adj.count -= dropped.len();
        Ok(dropped.len())
    }

    async fn remove_node(&self, id: &str) -> MemoryResult<usize> {
        let mut guard = write(&self.adj)?;
        let adj = &mut *guard;
        let outgoing = adj.out.remove(id).unwrap_or_default();
        for (kind, target) in &outgoing {
            unlink(&mut adj.inc, target, *kind, id);
        }
        // A self-loop was already unlinked above.
        let incoming = adj.inc.remove(id).unwrap_or_default();
        for (kind, source) in &incoming {
            unlink(&mut adj.out, source, *kind, id);
        }
        let removed = outgoing.len() + incoming.len();
        adj.count -= removed;
        Ok(removed)
    }

    async fn edge_count(&self) -> MemoryResult<usize> {
        Ok(read(&self.adj)?.count)
    }
}

/// Vector index backed by a `BTreeMap<(entity_id, facet), record>`.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<BTreeMap<(String, Facet), EmbeddingRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, record: EmbeddingRecord) -> MemoryResult<()> {
        write(&self.records)?.insert((record.entity_id.clone(), record.facet), record);
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> MemoryResult<Vec<VectorHit>> {
        let records = read(&self.records)?;
        let mut hits: Vec<VectorHit> = records
            .values()
            .map(|r| VectorHit {
                entity_id: r.entity_id.clone(),
                facet: r.facet,
                score: cosine_similarity(query, &r.vector),
            })
            .collect();
        drop(records);

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
                .then_with(|| a.facet.cmp(&b.facet))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn records_for(&self, entity_id: &str) -> MemoryResult<Vec<EmbeddingRecord>> {
        let records = read(&self.records)?;
        Ok(records
            .values()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, entity_id: &str, facets: &[Facet]) -> MemoryResult<usize> {
        let mut records = write(&self.records)?;
        let before = records.len();
        records.retain(|(id, facet), _| {
            id != entity_id || !(facets.is_empty() || facets.contains(facet))
        });
        Ok(before - records.len())
    }

    async fn keys(&self) -> MemoryResult<Vec<(String, Facet)>> {
        Ok(read(&self.records)?.keys().cloned().collect())
    }

    async fn len(&self) -> MemoryResult<usize> {
        Ok(read(&self.records)?.len())
    }
}
