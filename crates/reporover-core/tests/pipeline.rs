//! End-to-end ingestion and query scenarios against fake capabilities.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reporover_core::error::ServiceError;
use reporover_core::ingest::IngestOptions;
use reporover_core::models::{EntityKind, RelationKind};
use reporover_core::query::{self, RetrievalOp};
use reporover_core::retry::RetryPolicy;
use reporover_core::service::RepoRover;
use reporover_core::workflow::{TaskStatus, Value};

async fn entity_ids(rover: &RepoRover, repo: &str) -> BTreeSet<String> {
    rover
        .memory()
        .entities(repo)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect()
}

async fn names_of_kind(rover: &RepoRover, repo: &str, kind: EntityKind) -> BTreeSet<String> {
    rover
        .memory()
        .entities_by_kind(repo, kind)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[tokio::test]
async fn test_ingest_function_calls_and_docs() {
    let rover = rover(demo_scanner());
    let task = ingest_and_wait(&rover, "demo").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
    assert!(task.message.contains("2 files scanned"), "message: {}", task.message);

    let mem = rover.memory();
    let functions = mem.entities_by_kind("demo", EntityKind::Function).await.unwrap();
    assert!(functions.len() >= 2);
    let f = functions.iter().find(|e| e.name == "f").unwrap();
    let g = functions.iter().find(|e| e.name == "g").unwrap();

    let calls = mem.outgoing(&f.id, &[RelationKind::Calls]).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target_id, g.id);

    let chunks = mem.entities_by_kind("demo", EntityKind::DocChunk).await.unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.embedded));

    // README mentions `f` and `g` in code spans.
    let documented = mem.incoming(&g.id, &[RelationKind::Documents]).await.unwrap();
    assert_eq!(documented.len(), 1);
    assert_eq!(documented[0].source_id, chunks[0].id);

    // Annotation filled a cleaned-up summary and embedded it.
    let f = mem.get_entity(&f.id).await.unwrap();
    assert_eq!(f.summary.as_deref(), Some("Does its job."));
    assert!(f.embedded);
    assert!(mem.check_integrity().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_defines_top_level_functions() {
    let rover = rover(demo_scanner());
    ingest_and_wait(&rover, "demo").await;
    let mem = rover.memory();

    let files = mem.entities_by_kind("demo", EntityKind::File).await.unwrap();
    let lib = files.iter().find(|e| e.location.path == "src/lib.rs").unwrap();
    let defines = mem.outgoing(&lib.id, &[RelationKind::Defines]).await.unwrap();
    assert_eq!(defines.len(), 2);

    let readme = files.iter().find(|e| e.location.path == "README.md").unwrap();
    let docs = mem.outgoing(&readme.id, &[RelationKind::Documents]).await.unwrap();
    assert!(!docs.is_empty());
}

#[tokio::test]
async fn test_question_about_calls_finds_callee() {
    let rover = rover(demo_scanner());
    ingest_and_wait(&rover, "demo").await;

    let result = rover.ask("demo", "what does f call?").await.unwrap();
    let g = rover
        .memory()
        .find_by_name("demo", "g")
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.kind == EntityKind::Function)
        .unwrap();

    assert!(result.answer.evidence_ids.contains(&g.id));
    assert!(!result.answer.degraded);
    assert!(result.answer.text.contains('g'), "answer: {}", result.answer.text);
    assert_eq!(result.answer.evidence_ids, result.evidence.ids());
}

#[tokio::test]
async fn test_unparsable_file_is_a_warning() {
    let rover = rover(demo_scanner());
    let task = ingest_and_wait(&rover, "broken").await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.warnings.is_empty());
    assert!(task.warnings[0].starts_with("src/bad.rs:"), "{:?}", task.warnings);

    let functions = rover
        .memory()
        .entities_by_kind("broken", EntityKind::Function)
        .await
        .unwrap();
    assert_eq!(functions.len(), 2);
}

#[tokio::test]
async fn test_dangling_edge_is_a_warning() {
    let scanner = FakeScanner::new().with_repo("r", &[("src/a.rs", "fn a() { ghost() }\n")]);
    let rover = rover(scanner);
    let task = ingest_and_wait(&rover, "r").await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.warnings.iter().any(|w| w.contains("dangling edge")), "{:?}", task.warnings);
    assert!(rover.memory().check_integrity().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let rover = rover(demo_scanner());
    ingest_and_wait(&rover, "demo").await;
    let mem = rover.memory();
    let ids_1 = entity_ids(&rover, "demo").await;
    let edges_1 = mem.relationships("demo").await.unwrap();
    let keys_1 = mem.embedding_keys("demo").await.unwrap();

    let task = ingest_and_wait(&rover, "demo").await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.message.contains("0 entities annotated"), "message: {}", task.message);

    let ids_2 = entity_ids(&rover, "demo").await;
    assert_eq!(ids_1, ids_2);
    assert_eq!(edges_1, mem.relationships("demo").await.unwrap());
    assert_eq!(keys_1, mem.embedding_keys("demo").await.unwrap());
}

#[tokio::test]
async fn test_scan_failure_ends_task_with_error() {
    let rover = rover(demo_scanner());
    let task = ingest_and_wait(&rover, "missing").await;
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.message, "scan failed: no such repository: missing");
}

#[tokio::test]
async fn test_second_ingest_while_running_is_rejected() {
    let rover = rover(demo_scanner().with_delay(Duration::from_millis(200)));
    let first = rover.ingest("demo").await.unwrap();
    match rover.ingest("demo").await {
        Err(ServiceError::AlreadyRunning { repository, task_id }) => {
            assert_eq!(repository, "demo");
            assert_eq!(task_id, first);
        }
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    // A different repository is independent.
    assert!(rover.ingest("broken").await.is_ok());

    let done = rover.wait(&first, Duration::from_millis(5)).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(rover.ingest("demo").await.is_ok());
}

#[tokio::test]
async fn test_query_before_ingest_is_not_ready() {
    let rover = rover(demo_scanner());
    assert!(matches!(
        rover.ask("demo", "what does f call?").await,
        Err(ServiceError::NotReady(_))
    ));

    let task = ingest_and_wait(&rover, "missing").await;
    assert_eq!(task.status, TaskStatus::Error);
    assert!(matches!(
        rover.ask("missing", "anything?").await,
        Err(ServiceError::NotReady(_))
    ));
    assert!(matches!(
        rover.ask("demo", "   ").await,
        Err(ServiceError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_cancelled_ingestion_ends_in_error() {
    let rover = rover(demo_scanner().with_delay(Duration::from_millis(200)));
    let id = rover.ingest("demo").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    rover.cancel(&id).unwrap();
    let task = rover.wait(&id, Duration::from_millis(5)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.message, "cancelled");
    assert!(!rover.is_ready("demo").unwrap());
}

#[tokio::test]
async fn test_generator_outage_fails_annotate_when_fail_fast() {
    let caps = capabilities(demo_scanner(), Arc::new(DownGenerator));
    let rover = RepoRover::new(caps).unwrap();
    let task = ingest_and_wait(&rover, "demo").await;
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.message.starts_with("annotate failed:"), "message: {}", task.message);
    assert!(task.message.contains("generate failed after 2 attempts"), "message: {}", task.message);

    // Structure written before the failing step stays.
    let functions = rover
        .memory()
        .entities_by_kind("demo", EntityKind::Function)
        .await
        .unwrap();
    assert_eq!(functions.len(), 2);
}

#[tokio::test]
async fn test_generator_outage_degrades_answer() {
    let mut caps = capabilities(demo_scanner(), Arc::new(DownGenerator));
    caps.ingest = IngestOptions {
        fail_fast: false,
        retry: RetryPolicy::immediate(0),
        ..Default::default()
    };
    let rover = RepoRover::new(caps).unwrap();
    let task = ingest_and_wait(&rover, "demo").await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.warnings.len(), 2, "{:?}", task.warnings);

    let result = rover.ask("demo", "what does f call?").await.unwrap();
    assert!(result.answer.degraded);
    assert!(result.answer.text.contains("`g`"), "answer: {}", result.answer.text);
    assert!(!result.answer.evidence_ids.is_empty());
}

#[tokio::test]
async fn test_reingest_after_edit_drops_stale_entities() {
    let scanner = Arc::new(FakeScanner::new().with_repo(
        "r",
        &[
            ("src/lib.rs", "fn f() { g() }\nfn g() { 1 }\n"),
            ("src/old.rs", "fn old() { 3 }\n"),
            ("README.md", "Use `g` for numbers.\n"),
        ],
    ));
    let mut caps = capabilities(FakeScanner::new(), Arc::new(EchoGenerator::new()));
    caps.scanner = scanner.clone();
    let rover = RepoRover::new(caps).unwrap();
    let task = ingest_and_wait(&rover, "r").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);

    // g becomes h and old.rs is deleted.
    scanner.set_repo(
        "r",
        &[
            ("src/lib.rs", "fn f() { h() }\nfn h() { 2 }\n"),
            ("README.md", "Use `h` for numbers.\n"),
        ],
    );
    let task = ingest_and_wait(&rover, "r").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
    assert!(task.message.contains("3 stale entities removed"), "message: {}", task.message);

    let mem = rover.memory();
    let functions = names_of_kind(&rover, "r", EntityKind::Function).await;
    assert_eq!(functions, BTreeSet::from(["f".to_string(), "h".to_string()]));
    let entities = mem.entities("r").await.unwrap();
    assert!(entities.iter().all(|e| e.location.path != "src/old.rs"));

    let f = entities.iter().find(|e| e.name == "f").unwrap();
    let h = entities.iter().find(|e| e.name == "h").unwrap();
    let calls = mem.outgoing(&f.id, &[RelationKind::Calls]).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target_id, h.id);

    let chunk = entities.iter().find(|e| e.kind == EntityKind::DocChunk).unwrap();
    let documented = mem.outgoing(&chunk.id, &[RelationKind::Documents]).await.unwrap();
    assert_eq!(documented.len(), 1);
    assert_eq!(documented[0].target_id, h.id);
    assert!(mem.check_integrity().await.unwrap().is_empty());

    let result = rover.ask("r", "what does f call?").await.unwrap();
    let names: Vec<&str> = result.evidence.items.iter().map(|e| e.entity.name.as_str()).collect();
    assert!(names.contains(&"h"), "{:?}", names);
    assert!(!names.contains(&"g"), "{:?}", names);
    assert!(!result.answer.text.contains("`g`"), "answer: {}", result.answer.text);
}

#[tokio::test]
async fn test_unparsable_file_keeps_previous_entities() {
    let scanner = Arc::new(FakeScanner::new().with_repo("r", &[("src/lib.rs", LIB_RS)]));
    let mut caps = capabilities(FakeScanner::new(), Arc::new(EchoGenerator::new()));
    caps.scanner = scanner.clone();
    let rover = RepoRover::new(caps).unwrap();
    ingest_and_wait(&rover, "r").await;
    let before = entity_ids(&rover, "r").await;

    scanner.set_repo("r", &[("src/lib.rs", "fn f( @@")]);
    let task = ingest_and_wait(&rover, "r").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
    assert!(!task.message.contains("stale"), "message: {}", task.message);
    assert_eq!(before, entity_ids(&rover, "r").await);
}

#[tokio::test]
async fn test_architecture_question_lists_modules_and_types() {
    let scanner = FakeScanner::new().with_repo(
        "layered",
        &[(
            "src/app.rs",
            "struct Config\n\
             mod cli\nfn run() { parse() }\nfn parse() { 1 }\n\
             mod store\nfn save() { 2 }\n",
        )],
    );
    let mut caps = capabilities(scanner, Arc::new(EchoGenerator::new()));
    // Leave vector search out so only the catalog listing and the graph
    // contribute evidence.
    caps.query.top_k = 0;
    let rover = RepoRover::new(caps.clone()).unwrap();
    ingest_and_wait(&rover, "layered").await;

    let outcome = query::plan(&caps, "layered", "What is the overall architecture?")
        .await
        .unwrap();
    let plan = match &outcome.outputs[0] {
        Value::Plan(plan) => plan.clone(),
        other => panic!("unexpected output: {}", other.type_name()),
    };
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, RetrievalOp::ListKinds { kinds, .. }
            if kinds == &vec![EntityKind::Module, EntityKind::Class])));
    assert!(plan
        .ops
        .iter()
        .any(|op| matches!(op, RetrievalOp::Traverse { kinds, .. }
            if kinds.contains(&RelationKind::Contains))));

    let result = rover.ask("layered", "What is the overall architecture?").await.unwrap();
    let names: BTreeSet<&str> =
        result.evidence.items.iter().map(|e| e.entity.name.as_str()).collect();
    for expected in ["cli", "store", "Config", "run", "parse", "save"] {
        assert!(names.contains(expected), "missing {}: {:?}", expected, names);
    }

    // A question about one entity does not list the whole catalog.
    let result = rover.ask("layered", "What does save return?").await.unwrap();
    let names: BTreeSet<&str> =
        result.evidence.items.iter().map(|e| e.entity.name.as_str()).collect();
    assert!(!names.contains("cli"), "{:?}", names);
}

#[tokio::test]
async fn test_unsupported_language_is_a_warning() {
    let scanner = FakeScanner::new().with_repo(
        "mixed",
        &[
            ("src/lib.rs", LIB_RS),
            ("scripts/tool.py", "def main():\n    pass\n"),
            ("README.md", README_MD),
        ],
    );
    let rover = rover(scanner);
    let task = ingest_and_wait(&rover, "mixed").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
    assert_eq!(
        task.warnings
            .iter()
            .filter(|w| w.contains("unsupported language"))
            .collect::<Vec<_>>(),
        vec!["scripts/tool.py: unsupported language, skipped"]
    );
    let entities = rover.memory().entities("mixed").await.unwrap();
    assert!(entities.iter().all(|e| e.location.path != "scripts/tool.py"));
}

#[tokio::test]
async fn test_scanner_skips_are_task_warnings() {
    let scanner = demo_scanner().with_skipped(
        "demo",
        &[
            "assets/blob.bin: not valid UTF-8",
            "data/dump.sql: 9000000 bytes exceeds max_file_bytes (1048576)",
        ],
    );
    let rover = rover(scanner);
    let task = ingest_and_wait(&rover, "demo").await;
    assert_eq!(task.status, TaskStatus::Completed, "message: {}", task.message);
    assert!(task.warnings.contains(&"assets/blob.bin: not valid UTF-8".to_string()));
    assert!(task.warnings.iter().any(|w| w.starts_with("data/dump.sql: 9000000 bytes")));
}

#[tokio::test]
async fn test_repository_spellings_share_one_key() {
    let rover = rover(demo_scanner().with_delay(Duration::from_millis(200)));
    let first = rover.ingest("./demo/").await.unwrap();
    match rover.ingest("demo").await {
        Err(ServiceError::AlreadyRunning { repository, task_id }) => {
            assert_eq!(repository, "demo");
            assert_eq!(task_id, first);
        }
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }

    let done = rover.wait(&first, Duration::from_millis(5)).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed, "message: {}", done.message);
    assert_eq!(done.repository, "demo");
    assert!(rover.is_ready("demo").unwrap());
    assert!(rover.is_ready("./demo").unwrap());
    assert!(rover.ask("demo/", "what does f call?").await.is_ok());
}

