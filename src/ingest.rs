//! Ingestion from the CLI.
//!
//! Starts the `ingest` workflow for one repository and polls the task until
//! it finishes, reporting step transitions through a progress reporter.

use std::time::Duration;

use anyhow::{bail, Result};

use reporover_core::service::RepoRover;
use reporover_core::workflow::{Task, TaskStatus};

use crate::config::Config;
use crate::progress::{IngestProgressEvent, ProgressMode};
use crate::rover::build_rover;

#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub progress: ProgressMode,
    pub poll_interval: Duration,
}

impl IngestArgs {
    pub fn quiet() -> Self {
        Self {
            progress: ProgressMode::Off,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Ingest `repository` and wait for the task to finish.
///
/// Returns the final task; a task that ended in `error` is an error.
pub async fn ingest_and_wait(
    rover: &RepoRover,
    repository: &str,
    args: &IngestArgs,
) -> Result<Task> {
    let reporter = args.progress.reporter();
    let task_id = rover.ingest(repository).await?;

    let mut last_step: Option<String> = None;
    let task = loop {
        let task = rover.status(&task_id)?;
        if task.current_step != last_step {
            if let Some(step) = &task.current_step {
                reporter.report(IngestProgressEvent::Step {
                    repository: task.repository.clone(),
                    step: step.clone(),
                    warnings: task.warnings.len() as u64,
                });
            }
            last_step = task.current_step.clone();
        }
        if task.status.is_terminal() {
            break task;
        }
        tokio::time::sleep(args.poll_interval).await;
    };

    reporter.report(IngestProgressEvent::Finished {
        repository: task.repository.clone(),
        status: task.status.to_string(),
        message: task.message.clone(),
        warnings: task.warnings.len() as u64,
    });
    for warning in &task.warnings {
        tracing::warn!(task_id = %task.id, "{}", warning);
    }

    if task.status != TaskStatus::Completed {
        bail!("ingestion of {} failed: {}", repository, task.message);
    }
    Ok(task)
}

/// `rover ingest <repo>`.
pub async fn run_ingest(
    config: &Config,
    repository: &str,
    args: IngestArgs,
    json: bool,
) -> Result<()> {
    let rover = build_rover(config).await?;
    let task = ingest_and_wait(&rover, repository, &args).await?;
    let stats = rover.memory().stats(&task.repository).await?;

    if json {
        let out = serde_json::json!({ "task": task, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("ingest {}", task.repository);
    for (kind, count) in &stats.entities {
        println!("  {}: {}", kind, count);
    }
    println!("  relationships: {}", stats.relationships);
    println!("  embeddings: {}", stats.embeddings);
    println!("  warnings: {}", task.warnings.len());
    println!("{}", task.message);
    Ok(())
}
