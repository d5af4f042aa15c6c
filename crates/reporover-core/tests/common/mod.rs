//! Fake capabilities shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reporover_core::capability::{
    Capabilities, Embedder, Generator, InMemoryEpisodic, ParsedFile, RawEntity, RawRef,
    RawRelation, ScanOutput, Scanner, SourceParser, StaticCoreMemory,
};
use reporover_core::error::{CapabilityError, ParseError};
use reporover_core::ingest::IngestOptions;
use reporover_core::memory::SemanticMemory;
use reporover_core::models::{EntityKind, FileBlob, RelationKind};
use reporover_core::query::QueryOptions;
use reporover_core::retry::RetryPolicy;
use reporover_core::service::RepoRover;
use reporover_core::workflow::{Task, TaskStatus};

/// Serves file sets per repository name. Sets can be swapped between
/// ingestions to simulate edits.
pub struct FakeScanner {
    pub repos: Mutex<HashMap<String, Vec<(String, String)>>>,
    pub skipped: HashMap<String, Vec<String>>,
    pub delay: Duration,
}

impl FakeScanner {
    pub fn new() -> Self {
        Self {
            repos: Mutex::new(HashMap::new()),
            skipped: HashMap::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_repo(self, name: &str, files: &[(&str, &str)]) -> Self {
        self.set_repo(name, files);
        self
    }

    /// Report `warnings` as skipped files on every scan of `name`.
    pub fn with_skipped(mut self, name: &str, warnings: &[&str]) -> Self {
        self.skipped.insert(
            name.to_string(),
            warnings.iter().map(|w| w.to_string()).collect(),
        );
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_repo(&self, name: &str, files: &[(&str, &str)]) {
        self.repos.lock().unwrap().insert(
            name.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    async fn scan(&self, repository: &str) -> Result<ScanOutput, CapabilityError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let repos = self.repos.lock().unwrap();
        let files = repos
            .get(repository)
            .ok_or_else(|| CapabilityError::Fatal(format!("no such repository: {}", repository)))?;
        Ok(ScanOutput {
            files: files
                .iter()
                .map(|(p, c)| FileBlob::new(repository, p.clone(), c.clone()))
                .collect(),
            warnings: self.skipped.get(repository).cloned().unwrap_or_default(),
        })
    }
}

/// Line-oriented toy parser for `.rs` files: every `fn NAME(` line is a
/// function; `other()` inside a body is a call to a function of the same
/// file. A `mod NAME` line opens a module containing the functions after
/// it, and a `struct NAME` line is a type. A file containing `@@` fails to
/// parse.
pub struct ToyParser;

impl SourceParser for ToyParser {
    fn handles(&self, path: &str) -> bool {
        path.ends_with(".rs")
    }

    fn parse(&self, file: &FileBlob) -> Result<ParsedFile, ParseError> {
        if file.content.contains("@@") {
            return Err(ParseError::new(&file.path, "unexpected token `@@`"));
        }
        let mut parsed = ParsedFile::default();
        let mut functions = Vec::new();
        let mut module: Option<String> = None;
        for (i, line) in file.content.lines().enumerate() {
            let n = (i + 1) as u32;
            let line_trim = line.trim();
            if let Some(name) = line_trim.strip_prefix("mod ") {
                let name = name.trim_end_matches(&['{', ';', ' '][..]).to_string();
                parsed
                    .entities
                    .push(RawEntity::new(EntityKind::Module, &name).lines(n, n).body(line));
                module = Some(name);
                continue;
            }
            if let Some(name) = line_trim.strip_prefix("struct ") {
                let name = name.trim_end_matches(&['{', ';', ' '][..]);
                parsed
                    .entities
                    .push(RawEntity::new(EntityKind::Class, name).lines(n, n).body(line));
                continue;
            }
            let Some(rest) = line_trim.strip_prefix("fn ") else {
                continue;
            };
            let Some(name) = rest.split('(').next() else {
                continue;
            };
            let function = RawEntity::new(EntityKind::Function, name.trim()).lines(n, n).body(line);
            if let Some(m) = &module {
                parsed.relations.push(RawRelation::new(
                    RawRef::local(EntityKind::Module, m.clone()),
                    function.reference(),
                    RelationKind::Contains,
                ));
            }
            functions.push(function.clone());
            parsed.entities.push(function);
        }
        let names: Vec<String> = functions.iter().map(|e| e.name.clone()).collect();
        for caller in &functions {
            for callee in &names {
                if callee != &caller.name && caller.body.contains(&format!("{}()", callee)) {
                    parsed.relations.push(RawRelation::new(
                        RawRef::local(EntityKind::Function, caller.qualified_name.clone()),
                        RawRef::local(EntityKind::Function, callee.clone()),
                        RelationKind::Calls,
                    ));
                }
            }
        }
        // A call into a file that does not exist yet, to exercise dangling edges.
        if file.content.contains("ghost()") {
            if let Some(first) = functions.first() {
                parsed.relations.push(RawRelation::new(
                    first.reference(),
                    RawRef::local(EntityKind::Function, "ghost"),
                    RelationKind::Calls,
                ));
            }
        }
        Ok(parsed)
    }
}

/// Bag-of-words feature hashing into 64 dimensions.
pub struct WordEmbedder;

pub fn word_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 64];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % 64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        "word-hash"
    }

    fn dims(&self) -> usize {
        64
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts.iter().map(|t| word_vector(t)).collect())
    }
}

/// Summaries get a canned sentence; answers list every `name` quoted in the
/// evidence section of the prompt.
pub struct EchoGenerator {
    pub calls: AtomicUsize,
}

impl EchoGenerator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.ends_with("Summary:") {
            return Ok("Summary: This function does its job.".to_string());
        }
        let evidence = prompt.split("--- EVIDENCE").nth(1).unwrap_or("");
        let names: Vec<&str> = evidence.split('`').skip(1).step_by(2).collect();
        Ok(format!("The relevant entities are: {}.", names.join(", ")))
    }
}

/// Always fails with a transient error.
pub struct DownGenerator;

#[async_trait]
impl Generator for DownGenerator {
    fn model_name(&self) -> &str {
        "down"
    }

    async fn generate(&self, _prompt: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Transient("503 service unavailable".to_string()))
    }
}

pub const LIB_RS: &str = "fn f() { g() }\nfn g() { 1 }\n";
pub const README_MD: &str = "# Demo\n\nThe `f` function calls `g` to get a number.\n";

pub fn demo_scanner() -> FakeScanner {
    FakeScanner::new()
        .with_repo("demo", &[("src/lib.rs", LIB_RS), ("README.md", README_MD)])
        .with_repo(
            "broken",
            &[("src/bad.rs", "fn oops( @@"), ("src/lib.rs", LIB_RS)],
        )
}

pub fn capabilities(scanner: FakeScanner, generator: Arc<dyn Generator>) -> Capabilities {
    Capabilities {
        memory: Arc::new(SemanticMemory::in_memory()),
        scanner: Arc::new(scanner),
        parser: Arc::new(ToyParser),
        embedder: Arc::new(WordEmbedder),
        generator,
        episodic: Arc::new(InMemoryEpisodic::new()),
        core: Arc::new(StaticCoreMemory::default()),
        ingest: IngestOptions {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        },
        query: QueryOptions {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        },
    }
}

pub fn rover(scanner: FakeScanner) -> RepoRover {
    RepoRover::new(capabilities(scanner, Arc::new(EchoGenerator::new()))).unwrap()
}

pub async fn ingest_and_wait(rover: &RepoRover, repo: &str) -> Task {
    let id = rover.ingest(repo).await.unwrap();
    let task = tokio::time::timeout(
        Duration::from_secs(10),
        rover.wait(&id, Duration::from_millis(5)),
    )
    .await
    .expect("ingestion timed out")
    .unwrap();
    assert!(task.status == TaskStatus::Completed || task.status == TaskStatus::Error);
    task
}
