//! Workflow engine.
//!
//! Runs a registered [`Workflow`] either in the background (one tokio task
//! per run, tracked in the [`TaskTable`]) or inline in the caller. Steps run
//! strictly in sequence; each step boundary is an ordering barrier and a
//! cancellation point. The first failing step ends the run with
//! `"<step name> failed: <reason>"`; writes committed by earlier steps stay.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use crate::error::{WorkflowError, WorkflowResult};

use super::task::{Task, TaskId, TaskStatus, TaskTable};
use super::{Bindings, Inputs, StepDispatch, Value, Workflow};

/// Binding whose text value names the repository a run is about.
pub const SUBJECT_BINDING: &str = "repository";

pub struct WorkflowEngine {
    dispatch: Arc<dyn StepDispatch>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    tasks: Arc<TaskTable>,
}

/// What a finished run produced.
struct RunReport {
    bindings: Bindings,
    warnings: usize,
    summaries: Vec<String>,
}

impl WorkflowEngine {
    pub fn new(dispatch: Arc<dyn StepDispatch>) -> Self {
        Self::with_tasks(dispatch, TaskTable::new())
    }

    /// Engine tracking background runs in `tasks`, e.g. a table with a
    /// custom retention.
    pub fn with_tasks(dispatch: Arc<dyn StepDispatch>, tasks: TaskTable) -> Self {
        Self {
            dispatch,
            workflows: RwLock::new(HashMap::new()),
            tasks: Arc::new(tasks),
        }
    }

    /// Register (or replace) a workflow after validating it.
    pub fn define(&self, workflow: Workflow) -> WorkflowResult<()> {
        workflow.validate()?;
        let mut map = self
            .workflows
            .write()
            .map_err(|_| WorkflowError::InvalidDefinition("workflow registry poisoned".into()))?;
        info!(workflow = %workflow.name, steps = workflow.steps.len(), "workflow defined");
        map.insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> WorkflowResult<Arc<Workflow>> {
        let map = self
            .workflows
            .read()
            .map_err(|_| WorkflowError::InvalidDefinition("workflow registry poisoned".into()))?;
        map.get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))
    }

    /// Start `name` in the background and return its task id.
    ///
    /// The task's repository is taken from the `repository` text binding
    /// when present.
    pub fn run(&self, name: &str, input: Bindings) -> WorkflowResult<TaskId> {
        let workflow = self.workflow(name)?;
        let subject = match input.get(SUBJECT_BINDING).map(Arc::as_ref) {
            Some(Value::Text(s)) => s.clone(),
            _ => String::new(),
        };
        let task = self.tasks.create(&workflow.name, &subject);
        let id = task.id.clone();
        info!(task = %id, workflow = %workflow.name, repository = %subject, "task queued");

        let dispatch = Arc::clone(&self.dispatch);
        let tasks = Arc::clone(&self.tasks);
        let task_id = id.clone();
        tokio::spawn(async move {
            drive(dispatch, tasks, task_id, workflow, input).await;
        });
        Ok(id)
    }

    /// Run `name` to completion in the caller and return the final bindings.
    pub async fn run_inline(&self, name: &str, input: Bindings) -> WorkflowResult<Bindings> {
        let workflow = self.workflow(name)?;
        let report = run_steps(Arc::clone(&self.dispatch), workflow, input, None).await?;
        Ok(report.bindings)
    }

    pub fn status(&self, task_id: &str) -> WorkflowResult<Task> {
        self.tasks.require(task_id)
    }

    /// Request cooperative cancellation. The run stops at the next step
    /// boundary.
    pub fn cancel(&self, task_id: &str) -> WorkflowResult<Task> {
        let task = self.tasks.request_cancel(task_id)?;
        info!(task = task_id, status = %task.status, "cancellation requested");
        Ok(task)
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }
}

/// Background run of one task: execute the steps on their own tokio task so
/// a panicking step still leaves the task in a terminal state.
async fn drive(
    dispatch: Arc<dyn StepDispatch>,
    tasks: Arc<TaskTable>,
    task_id: TaskId,
    workflow: Arc<Workflow>,
    input: Bindings,
) {
    if tasks.is_cancel_requested(&task_id) {
        tasks.transition(&task_id, TaskStatus::Error, "cancelled");
        info!(task = %task_id, "task cancelled before start");
        return;
    }
    tasks.transition(&task_id, TaskStatus::Running, "running");
    info!(task = %task_id, workflow = %workflow.name, "task started");

    let run = tokio::spawn(run_steps(
        dispatch,
        Arc::clone(&workflow),
        input,
        Some((Arc::clone(&tasks), task_id.clone())),
    ))
    .await;

    match run {
        Ok(Ok(report)) => {
            let mut parts = report.summaries;
            parts.push(format!("{} warnings", report.warnings));
            let message = parts.join("; ");
            info!(task = %task_id, %message, "task completed");
            tasks.transition(&task_id, TaskStatus::Completed, message);
        }
        Ok(Err(WorkflowError::Cancelled)) => {
            info!(task = %task_id, "task cancelled");
            tasks.transition(&task_id, TaskStatus::Error, "cancelled");
        }
        Ok(Err(e)) => {
            error!(task = %task_id, error = %e, "task failed");
            tasks.transition(&task_id, TaskStatus::Error, e.to_string());
        }
        Err(join) => {
            error!(task = %task_id, error = %join, "task panicked");
            tasks.transition(&task_id, TaskStatus::Error, format!("internal error: {}", join));
        }
    }
}

async fn run_steps(
    dispatch: Arc<dyn StepDispatch>,
    workflow: Arc<Workflow>,
    mut bindings: Bindings,
    task: Option<(Arc<TaskTable>, TaskId)>,
) -> WorkflowResult<RunReport> {
    let mut warnings = 0;
    let mut summaries = Vec::new();

    for step in &workflow.steps {
        if let Some((tasks, id)) = &task {
            if tasks.is_cancel_requested(id) {
                return Err(WorkflowError::Cancelled);
            }
            tasks.set_step(id, &step.name);
        }

        let fail = |e: WorkflowError| WorkflowError::StepFailed {
            step: step.name.clone(),
            kind: step.kind,
            source: Box::new(e),
        };

        let inputs = Inputs::resolve(step, &bindings).map_err(fail)?;
        info!(workflow = %workflow.name, step = %step.name, kind = %step.kind, "step started");
        let outcome = dispatch.execute(step.kind, inputs).await.map_err(fail)?;

        if outcome.outputs.len() != step.outputs.len() {
            return Err(fail(WorkflowError::InvalidDefinition(format!(
                "step produced {} outputs, workflow binds {}",
                outcome.outputs.len(),
                step.outputs.len()
            ))));
        }
        for (name, value) in step.outputs.iter().zip(outcome.outputs) {
            bindings.insert(name.clone(), Arc::new(value));
        }

        for w in &outcome.warnings {
            warn!(step = %step.name, warning = %w, "step warning");
        }
        warnings += outcome.warnings.len();
        if let Some((tasks, id)) = &task {
            tasks.push_warnings(id, &outcome.warnings);
        }
        if let Some(summary) = outcome.summary {
            info!(step = %step.name, %summary, "step finished");
            summaries.push(summary);
        }
    }

    Ok(RunReport {
        bindings,
        warnings,
        summaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{StepKind, StepOutcome, StepSpec};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Echoes inputs; `annotate` fails, `scan` sleeps when asked to.
    struct Echo {
        scan_delay: Duration,
    }

    #[async_trait]
    impl StepDispatch for Echo {
        async fn execute(&self, kind: StepKind, inputs: Inputs) -> WorkflowResult<StepOutcome> {
            match kind {
                StepKind::Scan => {
                    tokio::time::sleep(self.scan_delay).await;
                    let repo = inputs.text(0)?.clone();
                    Ok(StepOutcome::new(Value::Text(format!("{}/scanned", repo)))
                        .with_summary("scanned")
                        .with_warnings(vec!["skipped a.bin".into()]))
                }
                StepKind::Retrieve => {
                    let prev = inputs.text(0)?.clone();
                    Ok(StepOutcome::new(Value::Text(format!("{}/retrieved", prev))))
                }
                StepKind::Annotate => Err(WorkflowError::Capability(
                    crate::error::CapabilityError::Fatal("model offline".into()),
                )),
                _ => Ok(StepOutcome::default()),
            }
        }
    }

    fn engine(scan_delay: Duration) -> WorkflowEngine {
        let engine = WorkflowEngine::new(Arc::new(Echo { scan_delay }));
        engine
            .define(Workflow {
                name: "chain".into(),
                description: String::new(),
                inputs: vec!["repository".into()],
                steps: vec![
                    StepSpec::new("scan", StepKind::Scan, &["repository"], &["a"]),
                    StepSpec::new("second", StepKind::Retrieve, &["a"], &["b"]),
                ],
            })
            .unwrap();
        engine
            .define(Workflow {
                name: "failing".into(),
                description: String::new(),
                inputs: vec!["repository".into()],
                steps: vec![
                    StepSpec::new("scan", StepKind::Scan, &["repository"], &["a"]),
                    StepSpec::new("annotate", StepKind::Annotate, &["repository", "a"], &["c"]),
                    StepSpec::new("after", StepKind::Retrieve, &["a"], &["b"]),
                ],
            })
            .unwrap();
        engine
    }

    fn input(repo: &str) -> Bindings {
        let mut b = Bindings::new();
        b.insert("repository".into(), Arc::new(Value::Text(repo.into())));
        b
    }

    async fn wait_terminal(engine: &WorkflowEngine, id: &str) -> Task {
        for _ in 0..200 {
            let task = engine.status(id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", id);
    }

    #[tokio::test]
    async fn test_inline_chains_bindings() {
        let engine = engine(Duration::ZERO);
        let out = engine.run_inline("chain", input("r")).await.unwrap();
        match out.get("b").map(Arc::as_ref) {
            Some(Value::Text(s)) => assert_eq!(s, "r/scanned/retrieved"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_background_run_completes_with_warnings() {
        let engine = engine(Duration::ZERO);
        let id = engine.run("chain", input("r")).unwrap();
        let task = wait_terminal(&engine, &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.repository, "r");
        assert_eq!(task.warnings, vec!["skipped a.bin"]);
        assert_eq!(task.message, "scanned; 1 warnings");
    }

    #[tokio::test]
    async fn test_old_runs_are_evicted() {
        let engine = WorkflowEngine::with_tasks(
            Arc::new(Echo {
                scan_delay: Duration::ZERO,
            }),
            TaskTable::with_retention(1),
        );
        engine
            .define(Workflow {
                name: "chain".into(),
                description: String::new(),
                inputs: vec!["repository".into()],
                steps: vec![StepSpec::new("scan", StepKind::Scan, &["repository"], &["a"])],
            })
            .unwrap();
        let first = engine.run("chain", input("r")).unwrap();
        wait_terminal(&engine, &first).await;
        let second = engine.run("chain", input("r")).unwrap();
        wait_terminal(&engine, &second).await;

        assert!(matches!(engine.status(&first), Err(WorkflowError::TaskNotFound(_))));
        assert_eq!(engine.status(&second).unwrap().status, TaskStatus::Completed);
        assert_eq!(engine.tasks().list().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_step_stops_run() {
        let engine = engine(Duration::ZERO);
        let id = engine.run("failing", input("r")).unwrap();
        let task = wait_terminal(&engine, &id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.message, "annotate failed: model offline");

        let err = engine.run_inline("failing", input("r")).await.unwrap_err();
        match err {
            WorkflowError::StepFailed { step, kind, .. } => {
                assert_eq!(step, "annotate");
                assert_eq!(kind, StepKind::Annotate);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_at_step_boundary() {
        let engine = engine(Duration::from_millis(100));
        let id = engine.run("chain", input("r")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.cancel(&id).unwrap();
        let task = wait_terminal(&engine, &id).await;
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.message, "cancelled");
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_task() {
        let engine = engine(Duration::ZERO);
        assert!(matches!(
            engine.run("nope", Bindings::new()),
            Err(WorkflowError::UnknownWorkflow(_))
        ));
        assert!(matches!(engine.status("nope"), Err(WorkflowError::TaskNotFound(_))));
        assert!(matches!(engine.cancel("nope"), Err(WorkflowError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_input_binding_fails_first_step() {
        let engine = engine(Duration::ZERO);
        let err = engine.run_inline("chain", Bindings::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "scan failed: step 'scan' is missing input binding 'repository'"
        );
    }
}
