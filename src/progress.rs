//! Ingestion progress reporting.
//!
//! `rover ingest --wait` polls the background task and reports each step
//! transition and the final outcome. Progress is emitted on **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for an ingestion task.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestProgressEvent {
    /// The task entered a new step.
    Step {
        repository: String,
        step: String,
        /// Warnings accumulated so far.
        warnings: u64,
    },
    /// The task reached a terminal status.
    Finished {
        repository: String,
        status: String,
        message: String,
        warnings: u64,
    },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest ./repo  annotate  (1,204 warnings)".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Step {
                repository,
                step,
                warnings,
            } => {
                if *warnings > 0 {
                    format!(
                        "ingest {}  {}  ({} warnings)\n",
                        repository,
                        step,
                        format_number(*warnings)
                    )
                } else {
                    format!("ingest {}  {}\n", repository, step)
                }
            }
            IngestProgressEvent::Finished {
                repository,
                status,
                message,
                ..
            } => format!("ingest {}  {}: {}\n", repository, status, message),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Step {
                repository,
                step,
                warnings,
            } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "step": step,
                "warnings": warnings
            }),
            IngestProgressEvent::Finished {
                repository,
                status,
                message,
                warnings,
            } => serde_json::json!({
                "event": "finished",
                "repository": repository,
                "status": status,
                "message": message,
                "warnings": warnings
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse a `--progress` value; `None` picks the TTY default.
    pub fn from_flag(flag: Option<&str>) -> anyhow::Result<Self> {
        match flag {
            None => Ok(Self::default_for_tty()),
            Some("off") | Some("none") => Ok(ProgressMode::Off),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some(other) => anyhow::bail!(
                "Unknown progress mode: {} (expected off, human, or json)",
                other
            ),
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
