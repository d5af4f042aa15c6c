//! Workflows as data.
//!
//! A [`Workflow`] is a named, ordered list of [`StepSpec`]s. Each step names a
//! [`StepKind`] from a closed set and wires its positional inputs and outputs
//! to binding names. Bindings start with the caller's input and grow as
//! steps publish their outputs; a later step can only read what an earlier
//! step (or the caller) bound.
//!
//! Definitions are plain serde data, so they can be loaded from JSON:
//!
//! ```rust
//! use reporover_core::workflow::{StepKind, Workflow};
//!
//! let wf = Workflow::from_json(r#"{
//!     "name": "scan-only",
//!     "inputs": ["repository"],
//!     "steps": [
//!         {"name": "scan", "kind": "scan", "inputs": ["repository"], "outputs": ["files"]}
//!     ]
//! }"#).unwrap();
//! assert_eq!(wf.steps[0].kind, StepKind::Scan);
//! ```

pub mod engine;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{EntityId, FileBlob};
use crate::query::{Answer, EvidenceBundle, RetrievalPlan};

pub use engine::WorkflowEngine;
pub use task::{Task, TaskId, TaskStatus, TaskTable, DEFAULT_TASK_RETENTION};

/// The closed set of step kinds. Each maps onto one pipeline function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Scan,
    ExtractStructure,
    ExtractDocs,
    Annotate,
    Plan,
    Retrieve,
    Synthesize,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Scan => "scan",
            StepKind::ExtractStructure => "extract_structure",
            StepKind::ExtractDocs => "extract_docs",
            StepKind::Annotate => "annotate",
            StepKind::Plan => "plan",
            StepKind::Retrieve => "retrieve",
            StepKind::Synthesize => "synthesize",
        }
    }

    /// Number of positional `(inputs, outputs)` the step takes.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            StepKind::Scan => (1, 1),
            StepKind::ExtractStructure => (2, 1),
            StepKind::ExtractDocs => (2, 1),
            StepKind::Annotate => (2, 1),
            StepKind::Plan => (2, 1),
            StepKind::Retrieve => (1, 1),
            StepKind::Synthesize => (2, 1),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl StepSpec {
    pub fn new(name: &str, kind: StepKind, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Binding names the caller must provide.
    #[serde(default)]
    pub inputs: Vec<String>,
    pub steps: Vec<StepSpec>,
}

impl Workflow {
    pub fn from_json(json: &str) -> WorkflowResult<Self> {
        serde_json::from_str(json).map_err(|e| WorkflowError::InvalidDefinition(e.to_string()))
    }

    /// Check that step names are unique, arities match their kinds, and
    /// every input is bound by the caller or an earlier step.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition("workflow name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut names = HashSet::new();
        let mut bound: HashSet<&str> = self.inputs.iter().map(String::as_str).collect();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            let (ins, outs) = step.kind.arity();
            if step.inputs.len() != ins || step.outputs.len() != outs {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step '{}' ({}) takes {} inputs and {} outputs, got {} and {}",
                    step.name,
                    step.kind,
                    ins,
                    outs,
                    step.inputs.len(),
                    step.outputs.len()
                )));
            }
            for input in &step.inputs {
                if !bound.contains(input.as_str()) {
                    return Err(WorkflowError::MissingBinding {
                        step: step.name.clone(),
                        binding: input.clone(),
                    });
                }
            }
            bound.extend(step.outputs.iter().map(String::as_str));
        }
        Ok(())
    }
}

/// A value flowing between steps.
#[derive(Debug, Clone)]
pub enum Value {
    Text(String),
    Files(Vec<FileBlob>),
    EntityIds(Vec<EntityId>),
    Plan(RetrievalPlan),
    Evidence(EvidenceBundle),
    Answer(Answer),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Files(_) => "files",
            Value::EntityIds(_) => "entity ids",
            Value::Plan(_) => "plan",
            Value::Evidence(_) => "evidence",
            Value::Answer(_) => "answer",
        }
    }
}

pub type Bindings = HashMap<String, Arc<Value>>;

/// Positional inputs resolved for one step.
#[derive(Debug, Clone)]
pub struct Inputs {
    names: Vec<String>,
    values: Vec<Arc<Value>>,
}

macro_rules! typed_input {
    ($fn:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $fn(&self, index: usize) -> WorkflowResult<&$ty> {
            match self.get(index)? {
                Value::$variant(v) => Ok(v),
                other => Err(WorkflowError::BindingType {
                    binding: self.names[index].clone(),
                    expected: $label,
                    found: other.type_name(),
                }),
            }
        }
    };
}

impl Inputs {
    /// Resolve `step`'s inputs from `bindings`.
    pub fn resolve(step: &StepSpec, bindings: &Bindings) -> WorkflowResult<Self> {
        let mut values = Vec::with_capacity(step.inputs.len());
        for name in &step.inputs {
            let value = bindings.get(name).ok_or_else(|| WorkflowError::MissingBinding {
                step: step.name.clone(),
                binding: name.clone(),
            })?;
            values.push(Arc::clone(value));
        }
        Ok(Self {
            names: step.inputs.clone(),
            values,
        })
    }

    pub fn from_values(values: Vec<(&str, Value)>) -> Self {
        let (names, values): (Vec<String>, Vec<Arc<Value>>) = values
            .into_iter()
            .map(|(n, v)| (n.to_string(), Arc::new(v)))
            .unzip();
        Self { names, values }
    }

    fn get(&self, index: usize) -> WorkflowResult<&Value> {
        self.values
            .get(index)
            .map(Arc::as_ref)
            .ok_or_else(|| WorkflowError::MissingBinding {
                step: String::new(),
                binding: format!("#{}", index),
            })
    }

    typed_input!(text, Text, String, "text");
    typed_input!(files, Files, Vec<FileBlob>, "files");
    typed_input!(entity_ids, EntityIds, Vec<EntityId>, "entity ids");
    typed_input!(plan, Plan, RetrievalPlan, "plan");
    typed_input!(evidence, Evidence, EvidenceBundle, "evidence");
}

/// What a step hands back to the engine.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Positional outputs, bound to the step's output names.
    pub outputs: Vec<Value>,
    /// Recoverable problems, listed on the task.
    pub warnings: Vec<String>,
    /// One-line description for the final task message.
    pub summary: Option<String>,
}

impl StepOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            outputs: vec![output],
            ..Default::default()
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Maps a step kind onto the function that implements it.
#[async_trait]
pub trait StepDispatch: Send + Sync {
    async fn execute(&self, kind: StepKind, inputs: Inputs) -> WorkflowResult<StepOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> Workflow {
        Workflow {
            name: "wf".into(),
            description: String::new(),
            inputs: vec!["repository".into()],
            steps: vec![
                StepSpec::new("scan", StepKind::Scan, &["repository"], &["files"]),
                StepSpec::new(
                    "structure",
                    StepKind::ExtractStructure,
                    &["repository", "files"],
                    &["entities"],
                ),
            ],
        }
    }

    #[test]
    fn test_valid_workflow() {
        assert!(two_step().validate().is_ok());
    }

    #[test]
    fn test_unbound_input_rejected() {
        let mut wf = two_step();
        wf.steps[1].inputs[1] = "blobs".into();
        match wf.validate() {
            Err(WorkflowError::MissingBinding { step, binding }) => {
                assert_eq!(step, "structure");
                assert_eq!(binding, "blobs");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_step_and_arity_rejected() {
        let mut wf = two_step();
        wf.steps[1].name = "scan".into();
        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidDefinition(_))));

        let mut wf = two_step();
        wf.steps[0].outputs.push("extra".into());
        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidDefinition(_))));
    }

    #[test]
    fn test_json_round_trip_kind_names() {
        let json = serde_json::to_string(&two_step()).unwrap();
        assert!(json.contains("\"extract_structure\""));
        assert_eq!(Workflow::from_json(&json).unwrap(), two_step());
        assert!(Workflow::from_json("{\"name\": 1}").is_err());
    }

    #[test]
    fn test_inputs_type_checked() {
        let inputs = Inputs::from_values(vec![("repository", Value::Text("r".into()))]);
        assert_eq!(inputs.text(0).unwrap(), "r");
        match inputs.files(0) {
            Err(WorkflowError::BindingType { binding, expected, found }) => {
                assert_eq!(binding, "repository");
                assert_eq!(expected, "files");
                assert_eq!(found, "text");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(inputs.text(3).is_err());
    }

    #[test]
    fn test_resolve_missing_binding() {
        let wf = two_step();
        let bindings: Bindings = HashMap::new();
        assert!(matches!(
            Inputs::resolve(&wf.steps[0], &bindings),
            Err(WorkflowError::MissingBinding { .. })
        ));
    }
}
