//! Wiring: build a [`RepoRover`] from configuration.
//!
//! Semantic memory lives in the process. The episodic log is the only state
//! persisted across runs (in SQLite at `db.path`).

use std::sync::Arc;

use anyhow::Result;

use reporover_core::capability::{Capabilities, CoreMemory, StaticCoreMemory};
use reporover_core::memory::SemanticMemory;
use reporover_core::service::RepoRover;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::episodic::SqliteEpisodic;
use crate::generation::create_generator;
use crate::parser::RustParser;
use crate::persona::JsonCoreMemory;
use crate::scanner::RepoScanner;
use crate::{db, migrate};

/// Connect the database, create the providers, and register the workflows.
pub async fn build_rover(config: &Config) -> Result<RepoRover> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;

    let core: Arc<dyn CoreMemory> = match &config.persona.path {
        Some(path) => Arc::new(JsonCoreMemory::load_or_create(path)?),
        None => Arc::new(StaticCoreMemory::default()),
    };

    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;
    tracing::info!(
        embedder = embedder.model_name(),
        dims = embedder.dims(),
        generator = generator.model_name(),
        "providers ready"
    );

    let caps = Capabilities {
        memory: Arc::new(SemanticMemory::in_memory()),
        scanner: Arc::new(RepoScanner::new(config.scan.clone())),
        parser: Arc::new(RustParser),
        embedder,
        generator,
        episodic: Arc::new(SqliteEpisodic::new(pool)),
        core,
        ingest: config.ingest_options(),
        query: config.query_options(),
    };
    Ok(RepoRover::new(caps)?)
}
