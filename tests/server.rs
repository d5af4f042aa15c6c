use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use reporover::config::Config;
use reporover::rover::build_rover;
use reporover::server::router;

struct TestServer {
    base: String,
    repo: String,
    client: reqwest::Client,
    _tmp: TempDir,
}

async fn start() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(
        repo.join("src/lib.rs"),
        "pub fn f() -> u32 {\n    g() + 1\n}\n\npub fn g() -> u32 {\n    41\n}\n",
    )
    .unwrap();

    let mut config = Config::minimal();
    config.db.path = tmp.path().join("rover.sqlite");
    config.scan.workspace_dir = tmp.path().join("workspace");
    let rover = Arc::new(build_rover(&config).await.unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(rover)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        repo: repo.to_string_lossy().to_string(),
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

impl TestServer {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn wait(&self, task_id: &str) -> Value {
        for _ in 0..200 {
            let (status, task) = self.get(&format!("/tasks/{}", task_id)).await;
            assert_eq!(status, 200);
            if task["status"] == "completed" || task["status"] == "error" {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {} did not finish", task_id);
    }
}

#[tokio::test]
async fn test_health() {
    let server = start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_then_query() {
    let server = start().await;

    let (status, body) = server
        .post("/query", json!({ "repository": server.repo, "question": "what does f call?" }))
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "not_ready");

    let (status, body) = server.post("/ingest", json!({ "repository": server.repo })).await;
    assert_eq!(status, 202);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let task = server.wait(&task_id).await;
    assert_eq!(task["status"], "completed", "task: {}", task);
    assert!(task["finished_at"].is_string());

    let (status, body) = server
        .post("/query", json!({ "repository": server.repo, "question": "what does f call?" }))
        .await;
    assert_eq!(status, 200, "body: {}", body);
    assert_eq!(body["degraded"], true);
    assert!(body["answer"].as_str().unwrap().contains("`g`"));
    let names: Vec<&str> = body["evidence"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"g"));
}

#[tokio::test]
async fn test_request_errors() {
    let server = start().await;

    let (status, body) = server.post("/ingest", json!({ "repository": "  " })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server.get("/tasks/does-not-exist").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server
        .post("/tasks/does-not-exist/cancel", json!({}))
        .await;
    assert_eq!(status, 404);

    let (status, body) = server
        .post("/query", json!({ "repository": server.repo, "question": "" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_failed_scan_reports_error_status() {
    let server = start().await;
    let (status, body) = server
        .post("/ingest", json!({ "repository": "/definitely/not/a/repo" }))
        .await;
    assert_eq!(status, 202);
    let task = server.wait(body["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "error");
    assert!(task["message"]
        .as_str()
        .unwrap()
        .contains("no such repository"));
}
