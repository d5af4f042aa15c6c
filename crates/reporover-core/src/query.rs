//! Query pipeline: `plan → retrieve → synthesize`.
//!
//! Stages run `Planning → Retrieving → Synthesizing → Done`. A failure while
//! planning or retrieving fails the query; a failed synthesis degrades to an
//! answer built from the raw evidence.
//!
//! # Retrieval
//!
//! A [`RetrievalPlan`] is an ordered list of store operations:
//!
//! 1. `VectorSearch` over the question embedding.
//! 2. `Lookup` of entities whose names appear in the question (or, for a
//!    follow-up without names, in the previous question).
//! 3. `ListKinds` of every module and type, when the question asks about
//!    the architecture of the repository.
//! 4. `Traverse` from the top hits so far, when the question asks about
//!    relationships or the architecture, or `always_traverse_depth > 0`.
//!    Architecture questions follow `contains`, `defines` and `imports`
//!    edges from every listed entity.
//!
//! Results are merged per entity keeping the best score and the smallest
//! structural distance, then capped to `max_evidence`. A traversal hit at
//! depth `d` from a seed scores `seed_score * traversal_decay^d`.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capability::{Capabilities, Interaction, InteractionKind, Persona};
use crate::error::WorkflowResult;
use crate::ingest::{embed_texts, truncate_chars};
use crate::models::{Entity, EntityId, EntityKind, RelationKind};
use crate::retry::{with_retry, RetryPolicy};
use crate::workflow::{StepKind, StepOutcome, StepSpec, Value, Workflow};

pub const QUERY_WORKFLOW: &str = "query";

/// Cap on entities pulled in per name mentioned in a question.
const MAX_LOOKUP_PER_NAME: usize = 5;
/// Score given to entities named explicitly in the question.
const LOOKUP_SCORE: f32 = 1.0;
/// Score given to modules and types listed for an architecture question.
const OVERVIEW_SCORE: f32 = 0.9;
const STRUCTURAL_KINDS: [RelationKind; 3] = [
    RelationKind::Contains,
    RelationKind::Defines,
    RelationKind::Imports,
];

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// `k` of the vector search.
    pub top_k: usize,
    pub max_evidence: usize,
    /// Traverse this deep on every query, relational or not. 0 = only on
    /// relational questions.
    pub always_traverse_depth: usize,
    /// Traversal depth for relational questions.
    pub relational_depth: usize,
    pub traversal_decay: f32,
    /// Number of top hits a traversal starts from.
    pub traverse_seeds: usize,
    pub history_turns: usize,
    pub relational_keywords: Vec<String>,
    /// Words marking a question about the repository as a whole.
    pub architecture_keywords: Vec<String>,
    pub snippet_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 8,
            max_evidence: 12,
            always_traverse_depth: 0,
            relational_depth: 1,
            traversal_decay: 0.5,
            traverse_seeds: 3,
            history_turns: 6,
            relational_keywords: default_relational_keywords(),
            architecture_keywords: default_architecture_keywords(),
            snippet_chars: 400,
            retry: RetryPolicy::default(),
        }
    }
}

pub fn default_relational_keywords() -> Vec<String> {
    [
        "call", "calls", "called", "caller", "callers", "callee", "callees", "invoke",
        "invokes", "use", "uses", "used", "import", "imports", "depend", "depends",
        "dependency", "dependencies", "relate", "related", "relationship", "connect",
        "connected", "inherit", "inherits", "contain", "contains", "define", "defines",
        "defined", "document", "documents", "documented",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_architecture_keywords() -> Vec<String> {
    [
        "architecture", "architectural", "structure", "structured", "overview", "design",
        "designed", "component", "components", "layout", "layer", "layers", "organized",
        "organised", "organization", "organisation",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Planning,
    Retrieving,
    Synthesizing,
    Done,
    Failed,
}

impl QueryStage {
    /// Stage a failing query step belongs to.
    pub fn of_step(kind: StepKind) -> Self {
        match kind {
            StepKind::Plan => QueryStage::Planning,
            StepKind::Retrieve => QueryStage::Retrieving,
            StepKind::Synthesize => QueryStage::Synthesizing,
            _ => QueryStage::Failed,
        }
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStage::Planning => "planning",
            QueryStage::Retrieving => "retrieving",
            QueryStage::Synthesizing => "synthesizing",
            QueryStage::Done => "done",
            QueryStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RetrievalOp {
    VectorSearch { k: usize },
    Lookup { ids: Vec<EntityId> },
    /// Every catalog entity of `kinds`, repository-local ones first.
    ListKinds { kinds: Vec<EntityKind>, limit: usize },
    /// Walk the graph from the `from_top` best hits gathered so far.
    Traverse {
        from_top: usize,
        kinds: Vec<RelationKind>,
        depth: usize,
    },
}

impl RetrievalOp {
    fn source(&self) -> EvidenceSource {
        match self {
            RetrievalOp::VectorSearch { .. } => EvidenceSource::VectorSearch,
            RetrievalOp::Lookup { .. } => EvidenceSource::Lookup,
            RetrievalOp::ListKinds { .. } => EvidenceSource::Catalog,
            RetrievalOp::Traverse { .. } => EvidenceSource::Traverse,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalPlan {
    pub repository: String,
    pub question: String,
    #[serde(skip)]
    pub query_vector: Vec<f32>,
    pub ops: Vec<RetrievalOp>,
    /// Recent question/answer turns, oldest first.
    #[serde(skip)]
    pub history: Vec<Interaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    VectorSearch,
    Lookup,
    Catalog,
    Traverse,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub entity: Entity,
    pub score: f32,
    pub source: EvidenceSource,
    /// Hops from the nearest direct hit; 0 for direct hits.
    pub distance: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceBundle {
    pub items: Vec<Evidence>,
}

impl EvidenceBundle {
    pub fn ids(&self) -> Vec<EntityId> {
        self.items.iter().map(|e| e.entity.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub evidence_ids: Vec<EntityId>,
    /// The generator failed and `text` lists the raw evidence instead.
    pub degraded: bool,
}

/// The `query` workflow definition.
pub fn query_workflow() -> Workflow {
    Workflow {
        name: QUERY_WORKFLOW.to_string(),
        description: "Answer a question from semantic memory".to_string(),
        inputs: vec!["repository".to_string(), "question".to_string()],
        steps: vec![
            StepSpec::new("plan", StepKind::Plan, &["repository", "question"], &["plan"]),
            StepSpec::new("retrieve", StepKind::Retrieve, &["plan"], &["evidence"]),
            StepSpec::new(
                "synthesize",
                StepKind::Synthesize,
                &["plan", "evidence"],
                &["answer"],
            ),
        ],
    }
}

// ============ plan ============

pub async fn plan(
    caps: &Capabilities,
    repository: &str,
    question: &str,
) -> WorkflowResult<StepOutcome> {
    let opts = &caps.query;
    let history: Vec<Interaction> = match caps.episodic.recent(opts.history_turns * 2).await {
        Ok(entries) => {
            let turns: Vec<Interaction> = entries.into_iter().filter(|i| i.is_turn()).collect();
            let skip = turns.len().saturating_sub(opts.history_turns);
            turns.into_iter().skip(skip).collect()
        }
        Err(e) => {
            warn!(error = %e, "episodic memory unavailable, planning without history");
            Vec::new()
        }
    };

    let query_vector = embed_texts(caps.embedder.as_ref(), &opts.retry, &[question.to_string()])
        .await?
        .pop()
        .unwrap_or_default();

    let mut ops = vec![RetrievalOp::VectorSearch { k: opts.top_k }];

    let mut ids = lookup_ids(caps, repository, question).await?;
    if ids.is_empty() {
        let previous = history
            .iter()
            .rev()
            .find(|i| i.kind == InteractionKind::Question);
        if let Some(prev) = previous {
            ids = lookup_ids(caps, repository, &prev.content).await?;
        }
    }
    if !ids.is_empty() {
        ops.push(RetrievalOp::Lookup { ids });
    }

    let overview = is_architecture_question(question, &opts.architecture_keywords);
    if overview {
        ops.push(RetrievalOp::ListKinds {
            kinds: vec![EntityKind::Module, EntityKind::Class],
            limit: opts.max_evidence,
        });
    }

    let relational = relational_kinds(question, &opts.relational_keywords);
    let mut depth = opts.always_traverse_depth;
    let mut from_top = opts.traverse_seeds;
    let mut kinds = Vec::new();
    if let Some(asked) = &relational {
        depth = depth.max(opts.relational_depth);
        kinds = asked.clone();
    }
    if overview {
        depth = depth.max(opts.relational_depth).max(1);
        from_top = from_top.max(opts.max_evidence);
        // An empty list from a relational question already means every kind.
        if relational.is_none() || !kinds.is_empty() {
            kinds.extend(STRUCTURAL_KINDS);
            kinds.sort();
            kinds.dedup();
        }
    }
    if depth > 0 {
        ops.push(RetrievalOp::Traverse {
            from_top,
            kinds,
            depth,
        });
    }

    info!(repository, ops = ops.len(), history = history.len(), "query planned");
    let plan = RetrievalPlan {
        repository: repository.to_string(),
        question: question.to_string(),
        query_vector,
        ops,
        history,
    };
    Ok(StepOutcome::new(Value::Plan(plan)))
}

/// Ids of code entities whose simple name appears as a token in `text`.
async fn lookup_ids(
    caps: &Capabilities,
    repository: &str,
    text: &str,
) -> WorkflowResult<Vec<EntityId>> {
    let mut ids = Vec::new();
    for token in identifier_tokens(text) {
        let found = caps.memory.find_by_name(repository, &token).await?;
        ids.extend(
            found
                .into_iter()
                .filter(|e| {
                    matches!(
                        e.kind,
                        EntityKind::Function | EntityKind::Class | EntityKind::Module
                    )
                })
                .take(MAX_LOOKUP_PER_NAME)
                .map(|e| e.id),
        );
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
}

/// Identifier-like tokens: runs of alphanumerics and `_`, plus the last
/// segment of `a::b` or `a.b` paths (which falls out of the split).
fn identifier_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_'))
        .map(str::to_string)
        .collect()
}

fn lowercase_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Whether `question` asks about the repository as a whole rather than a
/// particular entity.
pub fn is_architecture_question(question: &str, keywords: &[String]) -> bool {
    lowercase_words(question)
        .iter()
        .any(|w| keywords.iter().any(|k| k == w))
}

/// Relation kinds a question asks about, or `None` when it has no relational
/// intent. An empty list means every kind.
pub fn relational_kinds(question: &str, keywords: &[String]) -> Option<Vec<RelationKind>> {
    let words = lowercase_words(question);
    if !words.iter().any(|w| keywords.iter().any(|k| k == w)) {
        return None;
    }

    let mut kinds = BTreeSet::new();
    for w in &words {
        match w.as_str() {
            "call" | "calls" | "called" | "caller" | "callers" | "callee" | "callees"
            | "invoke" | "invokes" => {
                kinds.insert(RelationKind::Calls);
            }
            "import" | "imports" | "depend" | "depends" | "dependency" | "dependencies"
            | "use" | "uses" | "used" => {
                kinds.insert(RelationKind::Imports);
                kinds.insert(RelationKind::Calls);
            }
            "contain" | "contains" | "define" | "defines" | "defined" | "method"
            | "methods" | "member" | "members" => {
                kinds.insert(RelationKind::Contains);
                kinds.insert(RelationKind::Defines);
            }
            "document" | "documents" | "documented" | "docs" | "documentation" => {
                kinds.insert(RelationKind::Documents);
            }
            _ => {}
        }
    }
    Some(kinds.into_iter().collect())
}

// ============ retrieve ============

pub async fn retrieve(caps: &Capabilities, plan: &RetrievalPlan) -> WorkflowResult<StepOutcome> {
    let opts = &caps.query;
    let mut items: Vec<Evidence> = Vec::new();

    for op in &plan.ops {
        let source = op.source();
        match op {
            RetrievalOp::VectorSearch { k } => {
                let hits = caps
                    .memory
                    .similarity_search(&plan.query_vector, *k, Some(&plan.repository))
                    .await?;
                items.extend(hits.into_iter().map(|(entity, score)| Evidence {
                    entity,
                    score,
                    source,
                    distance: 0,
                }));
            }
            RetrievalOp::Lookup { ids } => {
                for id in ids {
                    match caps.memory.get_entity(id).await {
                        Ok(entity) => items.push(Evidence {
                            entity,
                            score: LOOKUP_SCORE,
                            source,
                            distance: 0,
                        }),
                        Err(e) => warn!(id = %id, error = %e, "lookup skipped"),
                    }
                }
            }
            RetrievalOp::ListKinds { kinds, limit } => {
                let mut listed = Vec::new();
                for kind in kinds {
                    listed.extend(caps.memory.entities_by_kind(&plan.repository, *kind).await?);
                }
                // Imported crates and modules have no body; list them last.
                listed.sort_by_key(|e| e.body.trim().is_empty());
                items.extend(listed.into_iter().take(*limit).map(|entity| Evidence {
                    entity,
                    score: OVERVIEW_SCORE,
                    source,
                    distance: 0,
                }));
            }
            RetrievalOp::Traverse {
                from_top,
                kinds,
                depth,
            } => {
                let seeds = dedupe_and_cap(items.clone(), *from_top);
                for seed in seeds {
                    let reached = caps
                        .memory
                        .traverse(&[seed.entity.id.clone()], kinds, *depth)
                        .await?;
                    for (entity, d) in reached {
                        items.push(Evidence {
                            entity,
                            score: seed.score * opts.traversal_decay.powi(d as i32),
                            source,
                            distance: seed.distance + d,
                        });
                    }
                }
            }
        }
    }

    let bundle = EvidenceBundle {
        items: dedupe_and_cap(items, opts.max_evidence),
    };
    info!(repository = %plan.repository, evidence = bundle.len(), "evidence retrieved");
    Ok(StepOutcome::new(Value::Evidence(bundle)))
}

/// Merge evidence per entity (highest score, smallest distance), order by
/// score then distance then id, and keep the first `max`.
pub fn dedupe_and_cap(items: Vec<Evidence>, max: usize) -> Vec<Evidence> {
    let mut merged: HashMap<EntityId, Evidence> = HashMap::new();
    for item in items {
        match merged.get_mut(&item.entity.id) {
            None => {
                merged.insert(item.entity.id.clone(), item);
            }
            Some(existing) => {
                let distance = existing.distance.min(item.distance);
                if item.score > existing.score {
                    *existing = item;
                }
                existing.distance = distance;
            }
        }
    }

    let mut out: Vec<Evidence> = merged.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.distance.cmp(&b.distance))
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
    out.truncate(max);
    out
}

// ============ synthesize ============

pub async fn synthesize(
    caps: &Capabilities,
    plan: &RetrievalPlan,
    evidence: &EvidenceBundle,
) -> WorkflowResult<StepOutcome> {
    let opts = &caps.query;
    let evidence_ids = evidence.ids();

    let (text, degraded) = if evidence.is_empty() {
        (
            format!(
                "I could not find anything in {} related to this question.",
                plan.repository
            ),
            false,
        )
    } else {
        let prompt = synthesis_prompt(&caps.core.persona(), plan, evidence, opts.snippet_chars);
        let generated =
            with_retry(&opts.retry, "generate", || caps.generator.generate(&prompt)).await;
        match generated {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!("generator returned an empty answer, falling back to evidence");
                (fallback_answer(evidence, opts.snippet_chars), true)
            }
            Err(e) => {
                warn!(error = %e, "answer generation failed, falling back to evidence");
                (fallback_answer(evidence, opts.snippet_chars), true)
            }
        }
    };

    let answer = Answer {
        text,
        evidence_ids,
        degraded,
    };
    record_turn(caps, plan, &answer).await;
    info!(
        repository = %plan.repository,
        degraded,
        evidence = answer.evidence_ids.len(),
        "answer synthesized"
    );
    Ok(StepOutcome::new(Value::Answer(answer)))
}

async fn record_turn(caps: &Capabilities, plan: &RetrievalPlan, answer: &Answer) {
    let question = Interaction::new("user", InteractionKind::Question, &plan.question)
        .with_metadata(serde_json::json!({ "repository": plan.repository }));
    let reply = Interaction::new("synthesizer", InteractionKind::Answer, &answer.text)
        .with_metadata(serde_json::json!({
            "repository": plan.repository,
            "evidence_ids": answer.evidence_ids,
            "degraded": answer.degraded,
        }));
    for entry in [question, reply] {
        if let Err(e) = caps.episodic.append(entry).await {
            warn!(error = %e, "failed to record interaction");
        }
    }
}

fn describe(e: &Evidence, snippet_chars: usize) -> String {
    format!(
        "- {} `{}` at {}: {}",
        e.entity.kind,
        e.entity.name,
        e.entity.location,
        truncate_chars(&e.entity.snippet(snippet_chars), snippet_chars).trim()
    )
}

/// Prompt carrying the persona, recent turns, the evidence, and the question.
pub fn synthesis_prompt(
    persona: &Persona,
    plan: &RetrievalPlan,
    evidence: &EvidenceBundle,
    snippet_chars: usize,
) -> String {
    let mut prompt = format!("You are {}, {}\n", persona.name, persona.description);
    if !persona.instructions.is_empty() {
        prompt.push_str("Your instructions are:\n");
        for instruction in &persona.instructions {
            prompt.push_str(&format!("- {}\n", instruction));
        }
    }

    prompt.push_str("\n--- CONVERSATION HISTORY ---\n");
    if plan.history.is_empty() {
        prompt.push_str("(none)\n");
    }
    for turn in &plan.history {
        let who = match turn.kind {
            InteractionKind::Question => "User",
            _ => "Assistant",
        };
        prompt.push_str(&format!("{}: {}\n", who, turn.content));
    }

    prompt.push_str(&format!(
        "\n--- EVIDENCE FROM {} ---\n",
        plan.repository
    ));
    for e in &evidence.items {
        prompt.push_str(&describe(e, snippet_chars));
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nUser's question: {}\n\nAnswer clearly and concisely using only the evidence above, \
         naming the entities you rely on.",
        plan.question
    ));
    prompt
}

/// Answer text used when generation fails: the evidence itself.
pub fn fallback_answer(evidence: &EvidenceBundle, snippet_chars: usize) -> String {
    let mut text = String::from("Answer generation is unavailable. Relevant evidence:\n");
    for e in &evidence.items {
        text.push_str(&describe(e, snippet_chars));
        text.push('\n');
    }
    text.trim_end().to_string()
}
