//! Task table.
//!
//! One [`Task`] per background workflow run. Status moves forward only:
//! `pending → running → {completed | error}`, or straight from `pending` to
//! `error` when a run is cancelled before it starts. Status and message are
//! overwritten in place, so polling is a single map lookup.
//!
//! Finished tasks are kept per `(workflow, repository)`: once a task turns
//! terminal, all but the `retention` most recently finished ones of its pair
//! are dropped. Active tasks are never evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

pub type TaskId = String;

/// Finished tasks kept per workflow and repository.
pub const DEFAULT_TASK_RETENTION: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Error)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Error)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow: String,
    pub repository: String,
    pub status: TaskStatus,
    pub message: String,
    pub current_step: Option<String>,
    pub warnings: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

type FinishQueues = HashMap<(String, String), VecDeque<TaskId>>;

#[derive(Debug)]
pub struct TaskTable {
    tasks: DashMap<TaskId, Task>,
    /// Finished task ids per `(workflow, repository)`, oldest first.
    finished: Mutex<FinishQueues>,
    retention: usize,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::with_retention(DEFAULT_TASK_RETENTION)
    }
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished tasks per workflow and repository
    /// (at least one).
    pub fn with_retention(retention: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            finished: Mutex::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    pub fn create(&self, workflow: &str, repository: &str) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            workflow: workflow.to_string(),
            repository: repository.to_string(),
            status: TaskStatus::Pending,
            message: "queued".to_string(),
            current_step: None,
            warnings: Vec::new(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        };
        self.tasks.insert(task.id.clone(), task.clone());
        task
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn require(&self, id: &str) -> WorkflowResult<Task> {
        self.get(id)
            .ok_or_else(|| WorkflowError::TaskNotFound(id.to_string()))
    }

    /// Move a task to `next`. Regressions and unknown ids are ignored and
    /// logged; returns whether the transition happened.
    pub fn transition(&self, id: &str, next: TaskStatus, message: impl Into<String>) -> bool {
        let (workflow, repository) = {
            let Some(mut task) = self.tasks.get_mut(id) else {
                warn!(task = id, status = %next, "transition on unknown task ignored");
                return false;
            };
            if !task.status.can_transition_to(next) {
                warn!(
                    task = id,
                    from = %task.status,
                    to = %next,
                    "task status regression ignored"
                );
                return false;
            }
            let now = Utc::now();
            match next {
                TaskStatus::Running => task.started_at = Some(now),
                TaskStatus::Completed | TaskStatus::Error => {
                    task.finished_at = Some(now);
                    task.current_step = None;
                }
                TaskStatus::Pending => {}
            }
            task.status = next;
            task.message = message.into();
            (task.workflow.clone(), task.repository.clone())
        };
        if next.is_terminal() {
            self.record_finished(id, workflow, repository);
        }
        true
    }

    /// Queue a finished task and drop the oldest finished tasks of its
    /// `(workflow, repository)` beyond the retention limit.
    fn record_finished(&self, id: &str, workflow: String, repository: String) {
        let Ok(mut finished) = self.finished.lock() else {
            warn!(task = id, "finished-task queue poisoned, nothing evicted");
            return;
        };
        let queue = finished.entry((workflow, repository)).or_default();
        queue.push_back(id.to_string());
        while queue.len() > self.retention {
            if let Some(old) = queue.pop_front() {
                self.tasks.remove(&old);
                debug!(task = %old, "finished task evicted");
            }
        }
    }

    pub fn set_step(&self, id: &str, step: &str) {
        if let Some(mut task) = self.tasks.get_mut(id) {
            task.current_step = Some(step.to_string());
            task.message = format!("running {}", step);
        }
    }

    pub fn push_warnings(&self, id: &str, warnings: &[String]) {
        if warnings.is_empty() {
            return;
        }
        if let Some(mut task) = self.tasks.get_mut(id) {
            task.warnings.extend_from_slice(warnings);
        }
    }

    /// Flag a task for cooperative cancellation. Terminal tasks are left
    /// untouched.
    pub fn request_cancel(&self, id: &str) -> WorkflowResult<Task> {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| WorkflowError::TaskNotFound(id.to_string()))?;
        if task.status.is_active() {
            task.cancel_requested = true;
        }
        Ok(task.clone())
    }

    pub fn is_cancel_requested(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|t| t.cancel_requested)
    }

    pub fn list(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| t.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let table = TaskTable::new();
        let task = table.create("ingest", "repo");
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(table.transition(&task.id, TaskStatus::Running, "running"));
        let running = table.get(&task.id).unwrap();
        assert!(running.started_at.is_some());

        assert!(table.transition(&task.id, TaskStatus::Completed, "done"));
        let done = table.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.message, "done");
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn test_regression_ignored() {
        let table = TaskTable::new();
        let task = table.create("ingest", "repo");
        table.transition(&task.id, TaskStatus::Running, "running");
        table.transition(&task.id, TaskStatus::Error, "boom");

        assert!(!table.transition(&task.id, TaskStatus::Running, "again"));
        assert!(!table.transition(&task.id, TaskStatus::Completed, "late"));
        assert!(!table.transition(&task.id, TaskStatus::Pending, "reset"));
        let t = table.get(&task.id).unwrap();
        assert_eq!(t.status, TaskStatus::Error);
        assert_eq!(t.message, "boom");
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let table = TaskTable::new();
        let task = table.create("ingest", "repo");
        assert!(!table.transition(&task.id, TaskStatus::Completed, "skip"));
        assert!(table.transition(&task.id, TaskStatus::Error, "cancelled"));
    }

    #[test]
    fn test_cancel_flags() {
        let table = TaskTable::new();
        let task = table.create("ingest", "repo");
        assert!(!table.is_cancel_requested(&task.id));
        table.request_cancel(&task.id).unwrap();
        assert!(table.is_cancel_requested(&task.id));
        assert!(matches!(
            table.request_cancel("nope"),
            Err(WorkflowError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_task_transition_ignored() {
        let table = TaskTable::new();
        assert!(!table.transition("nope", TaskStatus::Running, "x"));
        assert!(table.get("nope").is_none());
    }

    fn finish(table: &TaskTable, workflow: &str, repository: &str) -> TaskId {
        let task = table.create(workflow, repository);
        table.transition(&task.id, TaskStatus::Running, "running");
        table.transition(&task.id, TaskStatus::Completed, "done");
        task.id
    }

    #[test]
    fn test_finished_tasks_are_evicted_per_repository() {
        let table = TaskTable::with_retention(2);
        let ids: Vec<TaskId> = (0..4).map(|_| finish(&table, "ingest", "a")).collect();
        let other = finish(&table, "ingest", "b");
        let active = table.create("ingest", "a");

        assert!(table.get(&ids[0]).is_none());
        assert!(table.get(&ids[1]).is_none());
        assert!(table.get(&ids[2]).is_some());
        assert!(table.get(&ids[3]).is_some());
        assert!(table.get(&other).is_some());
        assert!(table.get(&active.id).is_some());
        assert_eq!(table.list().len(), 4);

        // The newest run always survives its own completion.
        table.transition(&active.id, TaskStatus::Error, "cancelled");
        assert!(table.get(&active.id).is_some());
        assert!(table.get(&ids[2]).is_none());
        assert!(table.get(&ids[3]).is_some());
    }

    #[test]
    fn test_retention_is_at_least_one() {
        let table = TaskTable::with_retention(0);
        let first = finish(&table, "ingest", "a");
        let second = finish(&table, "ingest", "a");
        assert!(table.get(&first).is_none());
        assert!(table.get(&second).is_some());
    }

    #[test]
    fn test_warnings_accumulate() {
        let table = TaskTable::new();
        let task = table.create("ingest", "repo");
        table.push_warnings(&task.id, &["a".to_string()]);
        table.push_warnings(&task.id, &["b".to_string()]);
        assert_eq!(table.get(&task.id).unwrap().warnings, vec!["a", "b"]);
    }
}
