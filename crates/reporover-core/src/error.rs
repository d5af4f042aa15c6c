//! Error types.
//!
//! Recoverable per-file and per-entity problems (`ParseError`,
//! `DanglingEdge`) are turned into task warnings by the pipelines; the rest
//! propagate and end the current step.

use thiserror::Error;

use crate::models::RelationKind;
use crate::query::QueryStage;
use crate::workflow::StepKind;

/// Errors raised by the stores and the memory facade.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("dangling edge {source_id} -[{kind}]-> {target_id}: entity {missing} is not in the catalog")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        kind: RelationKind,
        missing: String,
    },

    #[error("embedding references unknown entity: {0}")]
    UnknownEntity(String),

    #[error("store error: {0}")]
    Store(String),
}

impl MemoryError {
    /// Errors the ingestion steps downgrade to warnings.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MemoryError::DanglingEdge { .. })
    }
}

/// Errors returned by provider capabilities (embedding, generation, scanning).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// Worth retrying: rate limits, server errors, timeouts.
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

/// A single file the parser could not handle.
#[derive(Debug, Clone, Error)]
#[error("{path}: {reason}")]
pub struct ParseError {
    pub path: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the workflow engine and by step implementations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("step '{step}' is missing input binding '{binding}'")]
    MissingBinding { step: String, binding: String },

    #[error("binding '{binding}' holds {found}, expected {expected}")]
    BindingType {
        binding: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("cancelled")]
    Cancelled,

    #[error("{step} failed: {source}")]
    StepFailed {
        step: String,
        kind: StepKind,
        #[source]
        source: Box<WorkflowError>,
    },
}

/// Errors surfaced to callers of [`RepoRover`](crate::service::RepoRover).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("repository '{0}' has no completed ingestion")]
    NotReady(String),

    #[error("ingestion already running for '{repository}' (task {task_id})")]
    AlreadyRunning { repository: String, task_id: String },

    #[error("query failed while {stage}: {message}")]
    QueryFailed { stage: QueryStage, message: String },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
pub type WorkflowResult<T> = Result<T, WorkflowError>;
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_message_names_step() {
        let err = WorkflowError::StepFailed {
            step: "scan".to_string(),
            kind: StepKind::Scan,
            source: Box::new(WorkflowError::Capability(CapabilityError::Fatal(
                "no such directory".to_string(),
            ))),
        };
        assert_eq!(err.to_string(), "scan failed: no such directory");
    }

    #[test]
    fn test_dangling_edge_is_recoverable() {
        let err = MemoryError::DanglingEdge {
            source_id: "a".into(),
            target_id: "b".into(),
            kind: RelationKind::Calls,
            missing: "b".into(),
        };
        assert!(err.is_recoverable());
        assert!(!MemoryError::UnknownEntity("x".into()).is_recoverable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(CapabilityError::Transient("429".into()).is_transient());
        assert!(!CapabilityError::Fatal("401".into()).is_transient());
    }
}
