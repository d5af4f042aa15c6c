//! Ingestion pipeline: `scan → extract_structure → extract_docs → annotate`.
//!
//! Each step writes through [`SemanticMemory`](crate::memory::SemanticMemory)
//! before returning, so the next step sees everything the previous one
//! stored. Per-file and per-entity problems become task warnings; only
//! scanner failures, exhausted provider retries, and store errors end a step.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::capability::{Capabilities, Embedder, ParsedFile, RawRef};
use crate::chunk::{chunk_text, ChunkPolicy};
use crate::error::{CapabilityError, MemoryError, WorkflowError, WorkflowResult};
use crate::memory::UnitEmbedding;
use crate::models::{
    entity_id, entity_key, path_extension, Entity, EntityId, EntityKind, Facet, FileBlob, Location,
    RelationKind, Relationship,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::workflow::{StepKind, StepOutcome, StepSpec, Value, Workflow};

pub const INGEST_WORKFLOW: &str = "ingest";

/// Longest text sent to the embedder for one entity.
const MAX_EMBED_CHARS: usize = 8000;
/// Longest code body included in an annotation prompt.
const MAX_PROMPT_CODE_CHARS: usize = 4000;
/// Cap on `documents` edges from one chunk to entities sharing a mentioned name.
const MAX_MENTION_TARGETS: usize = 5;

pub const FALLBACK_SUMMARY: &str = "Purpose not determined.";

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub chunking: ChunkPolicy,
    /// Run the annotate step. When off the step passes its input through.
    pub annotate: bool,
    pub annotate_concurrency: usize,
    /// A generation failure aborts the annotate step instead of becoming a
    /// warning.
    pub fail_fast: bool,
    pub embed_batch_size: usize,
    pub retry: RetryPolicy,
    /// Lowercase extensions treated as documentation.
    pub doc_extensions: Vec<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkPolicy::default(),
            annotate: true,
            annotate_concurrency: 4,
            fail_fast: true,
            embed_batch_size: 32,
            retry: RetryPolicy::default(),
            doc_extensions: ["md", "markdown", "rst", "txt", "adoc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IngestOptions {
    pub fn is_doc(&self, file: &FileBlob) -> bool {
        self.is_doc_path(&file.path)
    }

    pub fn is_doc_path(&self, path: &str) -> bool {
        path_extension(path).is_some_and(|ext| self.doc_extensions.iter().any(|d| d == &ext))
    }
}

/// The `ingest` workflow definition.
pub fn ingestion_workflow() -> Workflow {
    Workflow {
        name: INGEST_WORKFLOW.to_string(),
        description: "Scan a repository and fill semantic memory".to_string(),
        inputs: vec!["repository".to_string()],
        steps: vec![
            StepSpec::new("scan", StepKind::Scan, &["repository"], &["files"]),
            StepSpec::new(
                "extract_structure",
                StepKind::ExtractStructure,
                &["repository", "files"],
                &["code_entities"],
            ),
            StepSpec::new(
                "extract_docs",
                StepKind::ExtractDocs,
                &["repository", "files"],
                &["doc_chunks"],
            ),
            StepSpec::new(
                "annotate",
                StepKind::Annotate,
                &["repository", "code_entities"],
                &["annotated"],
            ),
        ],
    }
}

// ============ scan ============

pub async fn scan(caps: &Capabilities, repository: &str) -> WorkflowResult<StepOutcome> {
    let out = caps.scanner.scan(repository).await?;
    info!(
        repository,
        files = out.files.len(),
        skipped = out.warnings.len(),
        "scan complete"
    );
    let summary = format!("{} files scanned", out.files.len());
    Ok(StepOutcome::new(Value::Files(out.files))
        .with_warnings(out.warnings)
        .with_summary(summary))
}

// ============ extract_structure ============

pub async fn extract_structure(
    caps: &Capabilities,
    repository: &str,
    files: &[FileBlob],
) -> WorkflowResult<StepOutcome> {
    let mut warnings = Vec::new();
    let mut parsed: Vec<(&FileBlob, ParsedFile)> = Vec::new();

    for file in files {
        if !caps.parser.handles(&file.path) {
            if !caps.ingest.is_doc(file) {
                debug!(path = %file.path, "no parser for file");
                warnings.push(format!("{}: unsupported language, skipped", file.path));
            }
            continue;
        }
        let parser = Arc::clone(&caps.parser);
        let blob = file.clone();
        match tokio::task::spawn_blocking(move || parser.parse(&blob)).await {
            Ok(Ok(p)) => parsed.push((file, p)),
            Ok(Err(e)) => {
                warn!(path = %file.path, reason = %e.reason, "parse failed, skipping file");
                warnings.push(e.to_string());
            }
            Err(join) => {
                warn!(path = %file.path, error = %join, "parser panicked, skipping file");
                warnings.push(format!("{}: parser panicked", file.path));
            }
        }
    }

    // Pass 1: every entity of the step, so intra-run edges resolve.
    let mut plain: BTreeMap<EntityId, Entity> = BTreeMap::new();
    let mut code: BTreeMap<EntityId, Entity> = BTreeMap::new();
    for (file, p) in &parsed {
        let file_entity = file_entity(repository, file);
        plain.insert(file_entity.id.clone(), file_entity);
        for raw in &p.entities {
            let path = if raw.external { "" } else { file.path.as_str() };
            let key = entity_key(raw.kind, path, &raw.qualified_name);
            let location = match raw.lines {
                Some((start, end)) => Location::span(&file.path, start, end),
                None => Location::file(&file.path),
            };
            let entity = Entity::new(repository, raw.kind, &key, &raw.name, location)
                .with_body(raw.body.clone());
            if raw.external || entity.body.trim().is_empty() {
                plain.insert(entity.id.clone(), entity);
            } else {
                code.insert(entity.id.clone(), entity);
            }
        }
    }
    for entity in plain.values().chain(code.values()) {
        caps.memory.upsert_entity(entity.clone()).await?;
    }

    let pending = code
        .values()
        .map(|e| PendingEmbedding {
            text: truncate_chars(&e.body, MAX_EMBED_CHARS),
            entity: e.clone(),
            facet: Facet::Body,
        })
        .collect();
    let embeddings = embed_units(caps, pending).await?;

    // Entities an earlier run extracted from these files (or from source
    // files that are gone) and this run did not are stale.
    let keep: HashSet<EntityId> = plain.keys().chain(code.keys()).cloned().collect();
    let parsed_paths: HashSet<&str> = parsed.iter().map(|(f, _)| f.path.as_str()).collect();
    let scanned: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
    let swept = caps
        .memory
        .sweep(repository, &keep, |e| {
            let path = e.location.path.as_str();
            e.kind != EntityKind::DocChunk
                && (parsed_paths.contains(path)
                    || (!scanned.contains(path) && caps.parser.handles(path)))
        })
        .await?;
    debug!(repository, ?swept, "structure swept");

    // Pass 2: relationships.
    let mut edges = 0;
    for (file, p) in &parsed {
        let file_id = resolve(repository, file, &RawRef::file());
        let mut rels: BTreeSet<Relationship> = p
            .entities
            .iter()
            .filter(|raw| raw.is_top_level())
            .map(|raw| {
                Relationship::new(
                    file_id.clone(),
                    resolve(repository, file, &raw.reference()),
                    RelationKind::Defines,
                )
            })
            .collect();
        rels.extend(p.relations.iter().map(|r| {
            Relationship::new(
                resolve(repository, file, &r.source),
                resolve(repository, file, &r.target),
                r.kind,
            )
        }));
        for rel in rels {
            match caps.memory.upsert_relationship(rel).await {
                Ok(_) => edges += 1,
                Err(e) if e.is_recoverable() => {
                    debug!(path = %file.path, error = %e, "dangling edge");
                    warnings.push(format!("{}: {}", file.path, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let ids: Vec<EntityId> = code.keys().cloned().collect();
    let mut summary = format!(
        "{} source files parsed, {} entities, {} relationships, {} embeddings",
        parsed.len(),
        plain.len() + code.len(),
        edges,
        embeddings
    );
    if swept.entities_removed > 0 {
        summary.push_str(&format!(", {} stale entities removed", swept.entities_removed));
    }
    info!(repository, %summary, warnings = warnings.len(), "structure extracted");
    Ok(StepOutcome::new(Value::EntityIds(ids))
        .with_warnings(warnings)
        .with_summary(summary))
}

fn file_entity(repository: &str, file: &FileBlob) -> Entity {
    Entity::new(
        repository,
        EntityKind::File,
        &entity_key(EntityKind::File, &file.path, ""),
        file.file_name(),
        Location::file(&file.path),
    )
}

fn resolve(repository: &str, file: &FileBlob, r: &RawRef) -> EntityId {
    let path = if r.external { "" } else { file.path.as_str() };
    entity_id(repository, r.kind, &entity_key(r.kind, path, &r.qualified_name))
}

// ============ extract_docs ============

pub async fn extract_docs(
    caps: &Capabilities,
    repository: &str,
    files: &[FileBlob],
) -> WorkflowResult<StepOutcome> {
    let docs: Vec<&FileBlob> = files.iter().filter(|f| caps.ingest.is_doc(f)).collect();

    let mut file_entities = Vec::new();
    let mut chunk_entities: Vec<(EntityId, Entity)> = Vec::new();
    for file in &docs {
        let fe = file_entity(repository, file);
        for chunk in chunk_text(&file.content, &caps.ingest.chunking) {
            let start = line_at(&file.content, chunk.offset);
            let end = line_at(&file.content, chunk.offset + chunk.text.len());
            let entity = Entity::new(
                repository,
                EntityKind::DocChunk,
                &entity_key(EntityKind::DocChunk, &file.path, &chunk.offset.to_string()),
                format!("{}#{}", file.file_name(), chunk.index),
                Location::span(&file.path, start, end),
            )
            .with_body(chunk.text);
            chunk_entities.push((fe.id.clone(), entity));
        }
        file_entities.push(fe);
    }

    for fe in &file_entities {
        caps.memory.upsert_entity(fe.clone()).await?;
    }
    for (_, chunk) in &chunk_entities {
        caps.memory.upsert_entity(chunk.clone()).await?;
    }

    let pending = chunk_entities
        .iter()
        .map(|(_, e)| PendingEmbedding {
            text: truncate_chars(&e.body, MAX_EMBED_CHARS),
            entity: e.clone(),
            facet: Facet::Chunk,
        })
        .collect();
    let embeddings = embed_units(caps, pending).await?;

    let keep: HashSet<EntityId> = file_entities
        .iter()
        .map(|f| f.id.clone())
        .chain(chunk_entities.iter().map(|(_, c)| c.id.clone()))
        .collect();
    let swept = caps
        .memory
        .sweep(repository, &keep, |e| {
            e.kind == EntityKind::DocChunk
                || (e.kind == EntityKind::File && caps.ingest.is_doc_path(&e.location.path))
        })
        .await?;
    debug!(repository, ?swept, "documentation swept");

    let mut warnings = Vec::new();
    let mut edges = 0;
    let mut name_cache: HashMap<String, Vec<EntityId>> = HashMap::new();
    for (file_id, chunk) in &chunk_entities {
        let mut rels = vec![Relationship::new(
            file_id.clone(),
            chunk.id.clone(),
            RelationKind::Documents,
        )];
        for name in backtick_mentions(&chunk.body) {
            if !name_cache.contains_key(&name) {
                let targets = caps
                    .memory
                    .find_by_name(repository, &name)
                    .await?
                    .into_iter()
                    .filter(|e| {
                        matches!(
                            e.kind,
                            EntityKind::Module | EntityKind::Class | EntityKind::Function
                        )
                    })
                    .take(MAX_MENTION_TARGETS)
                    .map(|e| e.id)
                    .collect();
                name_cache.insert(name.clone(), targets);
            }
            for target in name_cache.get(&name).into_iter().flatten() {
                rels.push(Relationship::new(
                    chunk.id.clone(),
                    target.clone(),
                    RelationKind::Documents,
                ));
            }
        }
        for rel in rels {
            match caps.memory.upsert_relationship(rel).await {
                Ok(_) => edges += 1,
                Err(e) if e.is_recoverable() => {
                    warnings.push(format!("{}: {}", chunk.location.path, e))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let ids: Vec<EntityId> = chunk_entities.iter().map(|(_, e)| e.id.clone()).collect();
    let summary = format!(
        "{} documents, {} chunks, {} relationships, {} embeddings",
        docs.len(),
        ids.len(),
        edges,
        embeddings
    );
    info!(repository, %summary, "documentation extracted");
    Ok(StepOutcome::new(Value::EntityIds(ids))
        .with_warnings(warnings)
        .with_summary(summary))
}

/// 1-based line number of byte `offset` in `text`.
fn line_at(text: &str, offset: usize) -> u32 {
    let end = offset.min(text.len());
    text.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() as u32 + 1
}

/// Identifiers quoted in inline code spans, e.g. `parse` or `Config::load()`.
fn backtick_mentions(text: &str) -> BTreeSet<String> {
    text.split('`')
        .skip(1)
        .step_by(2)
        .filter_map(|span| {
            let span = span.trim().trim_end_matches("()");
            let last = span.rsplit(|c| c == ':' || c == '.').next()?;
            let first = last.chars().next()?;
            let ident = (first.is_alphabetic() || first == '_')
                && last.chars().all(|c| c.is_alphanumeric() || c == '_');
            ident.then(|| last.to_string())
        })
        .collect()
}

// ============ annotate ============

pub async fn annotate(
    caps: &Capabilities,
    repository: &str,
    ids: &[EntityId],
) -> WorkflowResult<StepOutcome> {
    if !caps.ingest.annotate {
        return Ok(StepOutcome::new(Value::EntityIds(ids.to_vec()))
            .with_summary("annotation disabled"));
    }

    let mut targets = Vec::new();
    let mut skipped = 0;
    for id in ids {
        let entity = caps.memory.get_entity(id).await?;
        if !entity.kind.is_annotatable() {
            continue;
        }
        // Summary kept from an earlier run with an unchanged body.
        if entity.summary.is_some() {
            let records = caps.memory.embeddings_for(id).await?;
            if records.iter().any(|r| r.facet == Facet::Summary) {
                skipped += 1;
                continue;
            }
        }
        targets.push(entity);
    }

    let semaphore = Arc::new(Semaphore::new(caps.ingest.annotate_concurrency.max(1)));
    let mut set = JoinSet::new();
    for entity in targets {
        let caps = caps.clone();
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| CapabilityError::Fatal("annotation pool closed".to_string()))?;
            annotate_one(&caps, entity).await
        });
    }

    let mut annotated = Vec::new();
    let mut warnings = Vec::new();
    while let Some(joined) = set.join_next().await {
        let result = joined
            .map_err(|e| {
                AnnotateFailure::from(CapabilityError::Fatal(format!(
                    "annotation task panicked: {}",
                    e
                )))
            })
            .and_then(|r| r);
        match result {
            Ok(id) => annotated.push(id),
            Err(AnnotateFailure::Store(e)) => {
                set.abort_all();
                return Err(e.into());
            }
            Err(failure) if caps.ingest.fail_fast => {
                set.abort_all();
                return Err(failure.into());
            }
            Err(failure) => {
                warn!(repository, error = %failure, "annotation failed");
                warnings.push(failure.to_string());
            }
        }
    }
    annotated.sort();

    let summary = format!(
        "{} entities annotated, {} already annotated",
        annotated.len(),
        skipped
    );
    info!(repository, %summary, warnings = warnings.len(), "annotation complete");
    Ok(StepOutcome::new(Value::EntityIds(annotated))
        .with_warnings(warnings)
        .with_summary(summary))
}

/// Why one entity could not be annotated.
#[derive(Debug)]
enum AnnotateFailure {
    Provider { entity: String, error: CapabilityError },
    Store(MemoryError),
}

impl std::fmt::Display for AnnotateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotateFailure::Provider { entity, error } => write!(f, "{}: {}", entity, error),
            AnnotateFailure::Store(e) => write!(f, "{}", e),
        }
    }
}

impl From<CapabilityError> for AnnotateFailure {
    fn from(error: CapabilityError) -> Self {
        AnnotateFailure::Provider {
            entity: String::new(),
            error,
        }
    }
}

impl From<AnnotateFailure> for WorkflowError {
    fn from(f: AnnotateFailure) -> Self {
        match f {
            AnnotateFailure::Store(e) => WorkflowError::Memory(e),
            AnnotateFailure::Provider { entity, error } if entity.is_empty() => {
                WorkflowError::Capability(error)
            }
            AnnotateFailure::Provider { entity, error } => {
                WorkflowError::Capability(CapabilityError::Fatal(format!("{}: {}", entity, error)))
            }
        }
    }
}

async fn annotate_one(
    caps: &Capabilities,
    mut entity: Entity,
) -> Result<EntityId, AnnotateFailure> {
    let label = format!("{} {} ({})", entity.kind, entity.name, entity.location);
    let provider = |error: CapabilityError| AnnotateFailure::Provider {
        entity: label.clone(),
        error,
    };

    let prompt = annotation_prompt(&entity);
    let generator = Arc::clone(&caps.generator);
    let raw = with_retry(&caps.ingest.retry, "generate", || generator.generate(&prompt))
        .await
        .map_err(provider)?;
    let summary = clean_summary(&raw);
    debug!(entity = %entity.id, %summary, "summary generated");
    entity.summary = Some(summary.clone());

    let vectors = embed_texts(caps.embedder.as_ref(), &caps.ingest.retry, &[summary.clone()]).await;
    match vectors {
        Ok(mut v) => {
            let vector = v.pop().unwrap_or_default();
            let outcome = caps
                .memory
                .upsert_unit(entity, vec![UnitEmbedding::new(Facet::Summary, summary, vector)])
                .await
                .map_err(AnnotateFailure::Store)?;
            if let Some(e) = outcome.embedding_error {
                return Err(AnnotateFailure::Store(e));
            }
            Ok(outcome.id)
        }
        Err(e) => {
            // Keep the summary even though its vector is missing.
            caps.memory
                .upsert_unit(entity, Vec::new())
                .await
                .map_err(AnnotateFailure::Store)?;
            Err(provider(e))
        }
    }
}

/// One-sentence summary prompt for a code entity.
pub fn annotation_prompt(entity: &Entity) -> String {
    let kind = match entity.kind {
        EntityKind::Class => "type",
        EntityKind::Module => "module",
        _ => "function",
    };
    format!(
        "Provide a single, concise sentence that describes the purpose of the following {} \
         named '{}'. Do not add any introductory phrases or explanatory text. \
         Just provide the summary.\n\n\
         ```\n{}\n```\n\nSummary:",
        kind,
        entity.name,
        truncate_chars(&entity.body, MAX_PROMPT_CODE_CHARS)
    )
}

/// Strip boilerplate a model tends to prepend to a one-line summary.
pub fn clean_summary(raw: &str) -> String {
    const PREFIXES: [&str; 11] = [
        "summary:",
        "this function",
        "the function",
        "this method",
        "this type",
        "this struct",
        "this class",
        "this code",
        "the code",
        "purpose:",
        "description:",
    ];

    let mut summary = raw.trim();
    // "Summary: This function ..." carries two prefixes.
    while let Some(prefix) = PREFIXES.iter().find(|p| {
        summary
            .get(..p.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(p))
    }) {
        summary = summary[prefix.len()..].trim();
    }
    let summary = summary
        .trim_start_matches(&[':', '-', '"', '\'', '`'][..])
        .trim_end_matches(&['"', '\'', '`'][..])
        .trim();
    if summary.is_empty() {
        return FALLBACK_SUMMARY.to_string();
    }

    let mut chars = summary.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => FALLBACK_SUMMARY.to_string(),
    }
}

// ============ embedding helpers ============

struct PendingEmbedding {
    entity: Entity,
    facet: Facet,
    text: String,
}

/// Embed `pending` in batches and write each entity with its vector as a
/// unit. Returns the number of vectors written.
async fn embed_units(
    caps: &Capabilities,
    mut pending: Vec<PendingEmbedding>,
) -> WorkflowResult<usize> {
    let batch = caps.ingest.embed_batch_size.max(1);
    let mut written = 0;
    while !pending.is_empty() {
        let rest = pending.split_off(batch.min(pending.len()));
        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        let vectors = embed_texts(caps.embedder.as_ref(), &caps.ingest.retry, &texts).await?;
        for (p, vector) in pending.into_iter().zip(vectors) {
            let outcome = caps
                .memory
                .upsert_unit(p.entity, vec![UnitEmbedding::new(p.facet, p.text, vector)])
                .await?;
            if let Some(e) = outcome.embedding_error {
                return Err(e.into());
            }
            written += outcome.embeddings_written;
        }
        pending = rest;
    }
    Ok(written)
}

/// Embed with retry and check the provider returned one vector per text.
pub async fn embed_texts(
    embedder: &dyn Embedder,
    retry: &RetryPolicy,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let vectors = with_retry(retry, "embed", || embedder.embed(texts)).await?;
    if vectors.len() != texts.len() {
        return Err(CapabilityError::Fatal(format!(
            "embedder returned {} vectors for {} texts",
            vectors.len(),
            texts.len()
        )));
    }
    Ok(vectors)
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
