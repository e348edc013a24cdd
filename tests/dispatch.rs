//! Webhook dispatcher: at-most-once admission, duplicate suppression,
//! and background execution against the coordinator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{shell_task, wait_for, webhook_envelope, CountingExecutor, MockCoordinator};
use gale::client::TaskClient;
use gale::dispatch::dedup::DedupMap;
use gale::dispatch::Dispatcher;
use gale::executor::ExecutorRegistry;
use gale::model::{RunnerIdentity, TaskKind};

struct Harness {
    coordinator: MockCoordinator,
    executor: Arc<CountingExecutor>,
    webhook_url: String,
    dispatcher: Arc<Dispatcher>,
}

async fn spawn_harness(executor: Arc<CountingExecutor>) -> Harness {
    let coordinator = MockCoordinator::spawn().await;
    let client = Arc::new(TaskClient::new(&coordinator.url(), "instance-1", "device-1"));

    let mut registry = ExecutorRegistry::new();
    registry.register(TaskKind::Shell, executor.clone());

    let identity = RunnerIdentity::new("device-1".to_string(), "0xwallet".to_string());
    let dispatcher = Arc::new(Dispatcher::new(
        DedupMap::new(),
        client,
        Arc::new(registry),
        identity,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Arc::clone(&dispatcher).router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Harness {
        coordinator,
        executor,
        webhook_url: format!("http://{addr}/webhook"),
        dispatcher,
    }
}

#[tokio::test]
async fn duplicate_deliveries_execute_once() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let task = shell_task("task-dup");
    let body = webhook_envelope(&task);

    let http = reqwest::Client::new();
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let resp = http
            .post(&harness.webhook_url)
            .json(&body)
            .send()
            .await
            .unwrap();
        let value: serde_json::Value = resp.json().await.unwrap();
        statuses.push(value["status"].as_str().unwrap().to_string());
    }

    assert!(
        wait_for(Duration::from_secs(2), || harness.executor.call_count() >= 1).await,
        "task never executed"
    );
    // Leave room for the background activity to (incorrectly) run again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.executor.call_count(), 1, "task executed more than once");

    assert_eq!(statuses[0], "ok");
    assert_eq!(statuses[1], "skipped");
    assert_eq!(statuses[2], "skipped");
}

#[tokio::test]
async fn concurrent_duplicates_execute_once() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let task = shell_task("task-race");
    let body = webhook_envelope(&task);

    let http = reqwest::Client::new();
    let mut joins = Vec::new();
    for _ in 0..8 {
        let http = http.clone();
        let url = harness.webhook_url.clone();
        let body = body.clone();
        joins.push(tokio::spawn(async move {
            http.post(&url).json(&body).send().await.unwrap().status()
        }));
    }
    for join in joins {
        assert!(join.await.unwrap().is_success());
    }

    assert!(wait_for(Duration::from_secs(2), || harness.executor.call_count() >= 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.executor.call_count(), 1);
}

#[tokio::test]
async fn execution_claims_saves_and_completes() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let task = shell_task("task-flow");

    let http = reqwest::Client::new();
    http.post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();

    let state = &harness.coordinator.state;
    assert!(
        wait_for(Duration::from_secs(2), || {
            !state.completes.lock().unwrap().is_empty()
        })
        .await,
        "task never completed"
    );

    let starts = state.start_calls.lock().unwrap();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].0, "task-flow");
    assert_eq!(starts[0].1.as_deref(), Some("instance-1"));
    drop(starts);

    let results = state.results.lock().unwrap();
    let result = results.get("task-flow").expect("result saved");
    assert_eq!(result["task_id"], "task-flow");
    assert_eq!(result["device_id"], "device-1");
    assert_eq!(result["runner_address"], "device-1");
    assert_eq!(result["creator_id"], "creator-1");
    assert_eq!(
        result["device_id_hash"],
        json!(gale::model::device_id_hash("device-1"))
    );
    assert!(result["created_at"].as_u64().unwrap() > 0);
    drop(results);

    let headers = state.result_device_headers.lock().unwrap();
    assert_eq!(headers[0].as_deref(), Some("device-1"));
}

#[tokio::test]
async fn lost_claim_still_suppresses_retries() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let task = shell_task("task-claimed-elsewhere");
    harness
        .coordinator
        .state
        .start_status
        .lock()
        .unwrap()
        .insert("task-claimed-elsewhere".to_string(), 409);

    let http = reqwest::Client::new();
    http.post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || {
            !harness
                .coordinator
                .state
                .start_calls
                .lock()
                .unwrap()
                .is_empty()
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The executor never ran, and re-delivery is suppressed.
    assert_eq!(harness.executor.call_count(), 0);
    let resp = http
        .post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["status"], "skipped");
}

#[tokio::test]
async fn invalid_task_is_terminal_without_execution() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let mut task = shell_task("task-invalid");
    task.config.command.clear();

    let http = reqwest::Client::new();
    let resp = http
        .post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["status"], "ok");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.executor.call_count(), 0);

    // Second delivery hits the terminal entry.
    let resp = http
        .post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["status"], "skipped");
}

#[tokio::test]
async fn unknown_message_types_are_acknowledged() {
    let harness = spawn_harness(CountingExecutor::new()).await;

    let http = reqwest::Client::new();
    let resp = http
        .post(&harness.webhook_url)
        .json(&json!({"type": "future_feature", "payload": {"anything": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(harness.executor.call_count(), 0);
}

#[tokio::test]
async fn non_post_is_method_not_allowed() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let http = reqwest::Client::new();
    let resp = http.get(&harness.webhook_url).send().await.unwrap();
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn non_pending_tasks_are_skipped() {
    let harness = spawn_harness(CountingExecutor::new()).await;
    let mut task = shell_task("task-running");
    task.status = gale::model::TaskStatus::Running;

    let http = reqwest::Client::new();
    let resp = http
        .post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["status"], "skipped");
    assert_eq!(harness.executor.call_count(), 0);
}

#[tokio::test]
async fn in_flight_count_tracks_running_tasks() {
    let executor = CountingExecutor::slow(Duration::from_millis(300));
    let harness = spawn_harness(executor).await;
    let task = shell_task("task-busy");

    assert!(!harness.dispatcher.is_processing());

    let http = reqwest::Client::new();
    http.post(&harness.webhook_url)
        .json(&webhook_envelope(&task))
        .send()
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(1), || harness.dispatcher.is_processing()).await,
        "dispatcher never reported busy"
    );
    assert!(
        wait_for(Duration::from_secs(2), || !harness.dispatcher.is_processing()).await,
        "dispatcher stayed busy"
    );
}
