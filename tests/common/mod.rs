//! Shared test fixtures: an in-process coordinator and scriptable
//! executors.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use gale::error::GaleError;
use gale::executor::TaskExecutor;
use gale::model::{Task, TaskConfig, TaskKind, TaskResult, TaskStatus};

// ---------------------------------------------------------------------
// Mock coordinator
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct CoordinatorState {
    pub registrations: Mutex<Vec<Value>>,
    pub heartbeats: Mutex<Vec<Value>>,
    /// Number of upcoming heartbeat posts to fail with HTTP 500.
    pub heartbeat_failures: AtomicU32,
    pub start_calls: Mutex<Vec<(String, Option<String>)>>,
    /// Forced HTTP status for `start` by task id; 200 otherwise.
    pub start_status: Mutex<HashMap<String, u16>>,
    pub results: Mutex<HashMap<String, Value>>,
    pub result_device_headers: Mutex<Vec<Option<String>>>,
    /// When set, `save_result` fails with this error message.
    pub result_error: Mutex<Option<String>>,
    pub completes: Mutex<Vec<String>>,
    pub unregisters: Mutex<Vec<String>>,
}

pub struct MockCoordinator {
    pub state: Arc<CoordinatorState>,
    pub addr: SocketAddr,
}

impl MockCoordinator {
    pub async fn spawn() -> Self {
        let state = Arc::new(CoordinatorState::default());
        let router = Router::new()
            .route("/api/runners", post(register))
            .route("/api/runners/webhooks/{device_id}", delete(unregister))
            .route("/api/v1/runners/heartbeat", post(heartbeat))
            .route("/api/runners/tasks/available", get(available))
            .route("/api/runners/tasks/{id}/start", post(start_task))
            .route("/api/runners/tasks/{id}/complete", post(complete_task))
            .route("/api/runners/tasks/{id}/result", post(save_result))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock coordinator");
        let addr = listener.local_addr().expect("mock coordinator addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { state, addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.state.heartbeats.lock().unwrap().len()
    }

    pub fn last_heartbeat(&self) -> Option<Value> {
        self.state.heartbeats.lock().unwrap().last().cloned()
    }
}

async fn register(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.registrations.lock().unwrap().push(body);
    (StatusCode::CREATED, Json(json!({"webhook_id": "wh-test-1"})))
}

async fn unregister(
    State(state): State<Arc<CoordinatorState>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    state.unregisters.lock().unwrap().push(device_id);
    StatusCode::OK
}

async fn heartbeat(
    State(state): State<Arc<CoordinatorState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let failing = state
        .heartbeat_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "coordinator overloaded"})),
        );
    }
    state.heartbeats.lock().unwrap().push(body);
    (StatusCode::OK, Json(json!({})))
}

async fn available(State(_state): State<Arc<CoordinatorState>>) -> impl IntoResponse {
    Json(json!([]))
}

async fn start_task(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let runner_id = headers
        .get("X-Runner-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.start_calls.lock().unwrap().push((id.clone(), runner_id));

    let forced = state.start_status.lock().unwrap().get(&id).copied();
    match forced {
        Some(code) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"error": "task start rejected"})),
        ),
        None => (StatusCode::OK, Json(json!({}))),
    }
}

async fn complete_task(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.completes.lock().unwrap().push(id);
    StatusCode::OK
}

async fn save_result(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    if let Some(message) = state.result_error.lock().unwrap().clone() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": message})),
        );
    }
    let device = headers
        .get("X-Device-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.result_device_headers.lock().unwrap().push(device);
    state.results.lock().unwrap().insert(id, body);
    (StatusCode::OK, Json(json!({})))
}

// ---------------------------------------------------------------------
// Scriptable executor
// ---------------------------------------------------------------------

/// Counts executions; optionally sleeps to simulate long tasks and
/// records whether cancellation interrupted the sleep.
pub struct CountingExecutor {
    pub calls: AtomicUsize,
    pub sleep: Duration,
    pub cancelled: AtomicUsize,
}

impl CountingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            sleep: Duration::ZERO,
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn slow(sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            sleep,
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GaleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.sleep.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.sleep) => {}
                _ = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(GaleError::Cancelled);
                }
            }
        }
        let mut result = TaskResult::new(&task.id);
        result.stdout = "done".to_string();
        Ok(result)
    }
}

// ---------------------------------------------------------------------
// Task builders
// ---------------------------------------------------------------------

pub fn shell_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        kind: TaskKind::Shell,
        creator_id: "creator-1".to_string(),
        creator_address: "0xcreator".to_string(),
        reward: 1.5,
        config: TaskConfig {
            command: vec!["echo".to_string(), "hello".to_string()],
            ..TaskConfig::default()
        },
        status: TaskStatus::Pending,
    }
}

pub fn webhook_envelope(task: &Task) -> Value {
    json!({
        "type": "available_tasks",
        "payload": task,
    })
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
