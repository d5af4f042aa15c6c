//! Question answering from the CLI, plus the response shape shared with
//! `POST /query`.

use anyhow::Result;
use serde::Serialize;

use reporover_core::models::{EntityKind, EntityId};
use reporover_core::query::EvidenceSource;
use reporover_core::service::QueryResult;

use crate::config::Config;
use crate::ingest::{ingest_and_wait, IngestArgs};
use crate::rover::build_rover;

/// One evidence item as shown to callers.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceView {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// `path:start-end`
    pub location: String,
    pub score: f32,
    pub source: EvidenceSource,
    pub distance: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub evidence_ids: Vec<EntityId>,
    pub degraded: bool,
    pub evidence: Vec<EvidenceView>,
}

impl From<QueryResult> for QueryResponse {
    fn from(result: QueryResult) -> Self {
        let evidence = result
            .evidence
            .items
            .into_iter()
            .map(|e| EvidenceView {
                location: e.entity.location.to_string(),
                id: e.entity.id,
                kind: e.entity.kind,
                name: e.entity.name,
                score: e.score,
                source: e.source,
                distance: e.distance,
                summary: e.entity.summary,
            })
            .collect();
        Self {
            answer: result.answer.text,
            evidence_ids: result.answer.evidence_ids,
            degraded: result.answer.degraded,
            evidence,
        }
    }
}

/// Human-readable rendering: the answer, then one line per evidence item.
pub fn render(response: &QueryResponse) -> String {
    let mut out = String::new();
    out.push_str(response.answer.trim());
    out.push('\n');
    if response.degraded {
        out.push_str("\n(generation unavailable; showing retrieved evidence)\n");
    }
    if !response.evidence.is_empty() {
        out.push_str("\nEvidence:\n");
        for (i, e) in response.evidence.iter().enumerate() {
            out.push_str(&format!(
                "{}. [{:.3}] {} {}  {}\n",
                i + 1,
                e.score,
                e.kind,
                e.name,
                e.location
            ));
        }
    }
    out
}

/// `rover ask <repo> <question>`.
///
/// Memory is per process, so the repository is ingested first.
pub async fn run_ask(config: &Config, repository: &str, question: &str, json: bool) -> Result<()> {
    let rover = build_rover(config).await?;
    ingest_and_wait(&rover, repository, &IngestArgs::quiet()).await?;

    let result = rover.ask(repository, question).await?;
    let response = QueryResponse::from(result);
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", render(&response));
    }
    Ok(())
}
