//! # RepoRover CLI (`rover`)
//!
//! ## Usage
//!
//! ```bash
//! rover --config ./config/rover.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rover init` | Create the episodic database and the core memory file |
//! | `rover ingest <repo>` | Ingest a local path or git URL and report what was stored |
//! | `rover ask <repo> "<question>"` | Ingest, then answer a question about the repository |
//! | `rover serve` | Start the HTTP server |
//!
//! Logs go to stderr and honor `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use reporover::ingest::IngestArgs;
use reporover::progress::ProgressMode;
use reporover::{ask, config, ingest, migrate, persona, server};

/// RepoRover: ask questions about a code repository.
#[derive(Parser)]
#[command(
    name = "rover",
    about = "RepoRover: hybrid semantic memory over a code repository",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rover.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the episodic database and, when configured, the core memory file.
    ///
    /// Idempotent.
    Init,

    /// Ingest a repository (local path or git URL) and wait for the task.
    Ingest {
        repository: String,

        /// Progress on stderr: `human`, `json`, or `off`. Defaults to
        /// `human` on a terminal.
        #[arg(long)]
        progress: Option<String>,

        /// Print the final task and counts as JSON.
        #[arg(long)]
        json: bool,

        /// Status poll interval in milliseconds.
        #[arg(long, default_value_t = 200)]
        poll_ms: u64,
    },

    /// Ingest a repository, then answer a question about it.
    Ask {
        repository: String,
        question: String,

        /// Print the answer and evidence as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            if let Some(path) = &cfg.persona.path {
                persona::JsonCoreMemory::load_or_create(path)?;
            }
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            repository,
            progress,
            json,
            poll_ms,
        } => {
            let args = IngestArgs {
                progress: ProgressMode::from_flag(progress.as_deref())?,
                poll_interval: Duration::from_millis(poll_ms.max(10)),
            };
            ingest::run_ingest(&cfg, &repository, args, json).await?;
        }
        Commands::Ask {
            repository,
            question,
            json,
        } => {
            ask::run_ask(&cfg, &repository, &question, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
