//! # RepoRover
//!
//! Ask questions about a code repository. RepoRover ingests a repository
//! into a hybrid semantic memory (entity catalog, relationship graph, and
//! vector index) and answers questions from evidence gathered across all
//! three.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────────┐   ┌────────────────┐
//! │  Scanner    │──▶│  ingest workflow             │──▶│ SemanticMemory │
//! │ path / git  │   │ scan → structure → docs →    │   │ catalog+graph  │
//! └─────────────┘   │ annotate                     │   │ +vectors       │
//!                   └──────────────────────────────┘   └───────┬────────┘
//!                                                              │
//!                   ┌──────────────────────────────┐           │
//!                   │  query workflow              │◀──────────┘
//!                   │ plan → retrieve → synthesize │
//!                   └──────────────┬───────────────┘
//!                        ┌─────────┴─────────┐
//!                        ▼                   ▼
//!                   ┌──────────┐       ┌──────────┐
//!                   │   CLI    │       │   HTTP   │
//!                   │ (rover)  │       │  server  │
//!                   └──────────┘       └──────────┘
//! ```
//!
//! The memory, the workflow engine, and both pipelines live in
//! `reporover-core`. This crate supplies the concrete capabilities and the
//! surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`episodic`] | Episodic memory in SQLite |
//! | [`persona`] | Core memory JSON file |
//! | [`scanner`] | Local directory / git clone scanner |
//! | [`parser`] | `syn`-based Rust parser |
//! | [`embedding`] | Hash, OpenAI, and Ollama embedders |
//! | [`generation`] | OpenAI and Ollama generators |
//! | [`rover`] | Build the service from configuration |
//! | [`progress`] | Ingestion progress reporting |
//! | [`ingest`] | `rover ingest` |
//! | [`ask`] | `rover ask` and the query response shape |
//! | [`server`] | HTTP server |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod episodic;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod parser;
pub mod persona;
pub mod progress;
pub mod rover;
pub mod scanner;
pub mod server;
