//! The RepoRover service.
//!
//! Ties the capabilities, the memory facade, and the workflow engine
//! together, and enforces the per-repository rules:
//!
//! - at most one active ingestion per repository ([`ServiceError::AlreadyRunning`]);
//! - questions are answered only once the repository's latest ingestion
//!   completed ([`ServiceError::NotReady`]).
//!
//! Both rules key repositories by [`normalize_repository`], so `./repo`,
//! `repo/` and `repo` name the same repository.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::capability::{Capabilities, Interaction, InteractionKind};
use crate::error::{ServiceError, ServiceResult, WorkflowError, WorkflowResult};
use crate::ingest::{self, ingestion_workflow, INGEST_WORKFLOW};
use crate::memory::SemanticMemory;
use crate::query::{self, query_workflow, Answer, EvidenceBundle, QueryStage, QUERY_WORKFLOW};
use crate::workflow::{
    Bindings, Inputs, StepDispatch, StepKind, StepOutcome, Task, TaskId, TaskStatus, Value,
    Workflow, WorkflowEngine,
};

/// Routes each step kind to its pipeline function.
struct CapabilityDispatch {
    caps: Capabilities,
}

#[async_trait]
impl StepDispatch for CapabilityDispatch {
    async fn execute(&self, kind: StepKind, inputs: Inputs) -> WorkflowResult<StepOutcome> {
        let caps = &self.caps;
        match kind {
            StepKind::Scan => ingest::scan(caps, inputs.text(0)?).await,
            StepKind::ExtractStructure => {
                ingest::extract_structure(caps, inputs.text(0)?, inputs.files(1)?).await
            }
            StepKind::ExtractDocs => {
                ingest::extract_docs(caps, inputs.text(0)?, inputs.files(1)?).await
            }
            StepKind::Annotate => {
                ingest::annotate(caps, inputs.text(0)?, inputs.entity_ids(1)?).await
            }
            StepKind::Plan => query::plan(caps, inputs.text(0)?, inputs.text(1)?).await,
            StepKind::Retrieve => query::retrieve(caps, inputs.plan(0)?).await,
            StepKind::Synthesize => {
                query::synthesize(caps, inputs.plan(0)?, inputs.evidence(1)?).await
            }
        }
    }
}

/// A synthesized answer plus the evidence behind it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub answer: Answer,
    pub evidence: EvidenceBundle,
}

pub struct RepoRover {
    caps: Capabilities,
    engine: WorkflowEngine,
    /// Latest ingestion task per repository.
    latest: Mutex<HashMap<String, TaskId>>,
}

impl RepoRover {
    /// Build the service and register the `ingest` and `query` workflows.
    pub fn new(caps: Capabilities) -> ServiceResult<Self> {
        let dispatch = Arc::new(CapabilityDispatch { caps: caps.clone() });
        let engine = WorkflowEngine::new(dispatch);
        engine.define(ingestion_workflow())?;
        engine.define(query_workflow())?;
        Ok(Self {
            caps,
            engine,
            latest: Mutex::new(HashMap::new()),
        })
    }

    pub fn memory(&self) -> &Arc<SemanticMemory> {
        &self.caps.memory
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Replace a workflow definition, e.g. one loaded from JSON.
    pub fn define(&self, workflow: Workflow) -> ServiceResult<()> {
        Ok(self.engine.define(workflow)?)
    }

    fn latest_map(&self) -> ServiceResult<std::sync::MutexGuard<'_, HashMap<String, TaskId>>> {
        self.latest.lock().map_err(|_| {
            ServiceError::Workflow(WorkflowError::InvalidDefinition(
                "repository table poisoned".to_string(),
            ))
        })
    }

    /// Start ingesting `repository` in the background.
    pub async fn ingest(&self, repository: &str) -> ServiceResult<TaskId> {
        let repository = normalize_repository(repository);
        let repository = repository.as_str();
        if repository.is_empty() {
            return Err(ServiceError::InvalidRequest("repository is required".to_string()));
        }

        let task_id = {
            let mut latest = self.latest_map()?;
            if let Some(existing) = latest.get(repository) {
                if let Ok(task) = self.engine.status(existing) {
                    if task.status.is_active() {
                        return Err(ServiceError::AlreadyRunning {
                            repository: repository.to_string(),
                            task_id: task.id,
                        });
                    }
                }
            }
            let mut input = Bindings::new();
            input.insert(
                "repository".to_string(),
                Arc::new(Value::Text(repository.to_string())),
            );
            let id = self.engine.run(INGEST_WORKFLOW, input)?;
            latest.insert(repository.to_string(), id.clone());
            id
        };

        info!(repository, task = %task_id, "ingestion started");
        let note = Interaction::new(
            "ingestion",
            InteractionKind::Note,
            format!("ingestion of {} started", repository),
        )
        .with_metadata(serde_json::json!({ "task_id": task_id }));
        if let Err(e) = self.caps.episodic.append(note).await {
            warn!(error = %e, "failed to record ingestion note");
        }
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> ServiceResult<Task> {
        Ok(self.engine.status(task_id)?)
    }

    pub fn cancel(&self, task_id: &str) -> ServiceResult<Task> {
        Ok(self.engine.cancel(task_id)?)
    }

    /// The most recent ingestion task of `repository`, if any.
    pub fn latest_task(&self, repository: &str) -> ServiceResult<Option<Task>> {
        let latest = self.latest_map()?;
        Ok(latest
            .get(&normalize_repository(repository))
            .and_then(|id| self.engine.status(id).ok()))
    }

    pub fn is_ready(&self, repository: &str) -> ServiceResult<bool> {
        Ok(self
            .latest_task(repository)?
            .is_some_and(|t| t.status == TaskStatus::Completed))
    }

    /// Answer `question` about an ingested repository.
    pub async fn ask(&self, repository: &str, question: &str) -> ServiceResult<QueryResult> {
        let repository = normalize_repository(repository);
        let repository = repository.as_str();
        let question = question.trim();
        if question.is_empty() {
            return Err(ServiceError::InvalidRequest("question is required".to_string()));
        }
        if !self.is_ready(repository)? {
            return Err(ServiceError::NotReady(repository.to_string()));
        }

        let mut input = Bindings::new();
        input.insert(
            "repository".to_string(),
            Arc::new(Value::Text(repository.to_string())),
        );
        input.insert(
            "question".to_string(),
            Arc::new(Value::Text(question.to_string())),
        );

        let out = self
            .engine
            .run_inline(QUERY_WORKFLOW, input)
            .await
            .map_err(|e| match e {
                WorkflowError::StepFailed { kind, source, .. } => ServiceError::QueryFailed {
                    stage: QueryStage::of_step(kind),
                    message: source.to_string(),
                },
                other => ServiceError::Workflow(other),
            })?;

        let answer = match out.get("answer").map(Arc::as_ref) {
            Some(Value::Answer(a)) => a.clone(),
            _ => return Err(missing("answer")),
        };
        let evidence = match out.get("evidence").map(Arc::as_ref) {
            Some(Value::Evidence(e)) => e.clone(),
            _ => return Err(missing("evidence")),
        };
        Ok(QueryResult { answer, evidence })
    }

    /// Poll a task every `interval` until it reaches a terminal status.
    pub async fn wait(&self, task_id: &str, interval: Duration) -> ServiceResult<Task> {
        loop {
            let task = self.status(task_id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Canonical form of a repository reference.
///
/// URLs lose surrounding whitespace and trailing slashes. Local paths are
/// rebuilt from their components, which drops `.` segments and trailing
/// separators. An empty reference stays empty.
pub fn normalize_repository(reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains("://") || reference.starts_with("git@") {
        return reference.trim_end_matches('/').to_string();
    }
    if reference.is_empty() {
        return String::new();
    }
    let path: PathBuf = Path::new(reference)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if path.as_os_str().is_empty() {
        return ".".to_string();
    }
    path.to_string_lossy().into_owned()
}

fn missing(binding: &str) -> ServiceError {
    ServiceError::Workflow(WorkflowError::MissingBinding {
        step: QUERY_WORKFLOW.to_string(),
        binding: binding.to_string(),
    })
}
