//! # RepoRover Core
//!
//! Hybrid semantic memory and the workflows that fill and query it.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Entities, relationships, embedding records, file blobs |
//! | [`error`] | Typed errors for memory, capabilities, workflows, and the service |
//! | [`chunk`] | Sliding-window documentation chunker |
//! | [`embedding`] | Vector math helpers |
//! | [`capability`] | Traits for the external collaborators (scanner, parser, models, memories) |
//! | [`store`] | Entity catalog, relationship graph, and vector index |
//! | [`memory`] | [`SemanticMemory`](memory::SemanticMemory), the single write/read boundary over the stores |
//! | [`retry`] | Bounded retry with backoff for transient capability errors |
//! | [`workflow`] | Workflow definitions, the task table, and the engine |
//! | [`ingest`] | Ingestion steps: scan, extract_structure, extract_docs, annotate |
//! | [`query`] | Query steps: plan, retrieve, synthesize |
//! | [`service`] | [`RepoRover`](service::RepoRover): per-repository exclusivity and readiness |
//!
//! The crate does no file-system or network I/O of its own. Everything that
//! talks to the outside world comes in through [`capability`] traits, which
//! the `reporover` binary implements.

pub mod capability;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod query;
pub mod retry;
pub mod service;
pub mod store;
pub mod workflow;
