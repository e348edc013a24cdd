//! Inbound webhook: admits task deliveries, deduplicates them, and runs
//! each admitted task in a background activity. The HTTP response never
//! waits on execution.

pub mod dedup;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::client::TaskClient;
use crate::dispatch::dedup::DedupMap;
use crate::error::GaleError;
use crate::executor::ExecutorRegistry;
use crate::model::{RunnerIdentity, Task, TaskStatus};

/// Framed webhook envelope. Only `available_tasks` is understood;
/// unknown types are acknowledged and dropped so newer coordinators can
/// ship new message kinds without breaking old runners.
#[derive(Debug, Deserialize)]
pub struct WebhookMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub struct Dispatcher {
    dedup: DedupMap,
    client: Arc<TaskClient>,
    executors: Arc<ExecutorRegistry>,
    identity: RunnerIdentity,
    /// Count of executions currently running; the heartbeat scheduler
    /// reads it to report busy status.
    in_flight: Arc<AtomicUsize>,
    /// Cancelled on shutdown; every execution derives its context from
    /// this token.
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        dedup: DedupMap,
        client: Arc<TaskClient>,
        executors: Arc<ExecutorRegistry>,
        identity: RunnerIdentity,
    ) -> Self {
        Self {
            dedup,
            client,
            executors,
            identity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn in_flight_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Stop admitting work for running executions; already-spawned
    /// activities observe this through their child tokens.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/webhook", post(handle_webhook))
            .with_state(self)
    }

    /// Admission: dedup CAS first, then hand off to a background
    /// activity. Returns the response body status string.
    pub fn admit(self: Arc<Self>, task: Task) -> &'static str {
        if task.status != TaskStatus::Pending {
            tracing::warn!(task_id = %task.id, status = ?task.status, "task is not pending, skipping");
            return "skipped";
        }
        if !self.dedup.try_admit(&task.id) {
            tracing::debug!(task_id = %task.id, "duplicate delivery suppressed");
            return "skipped";
        }

        let dispatcher = self;
        let cancel = dispatcher.cancel.child_token();
        tokio::spawn(async move {
            dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
            let task_id = task.id.clone();

            if let Err(e) = dispatcher.process(task, cancel).await {
                if e.is_unavailable() {
                    tracing::info!(task_id = %task_id, "task claimed elsewhere: {e}");
                } else {
                    tracing::error!(task_id = %task_id, "task execution failed: {e}");
                }
            }

            // Terminal transition happens exactly once, on success and
            // on every failure path alike.
            dispatcher.dedup.mark_terminal(&task_id);
            dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        "ok"
    }

    /// One task's execution: claim, execute, enrich, persist, complete.
    async fn process(&self, task: Task, cancel: CancellationToken) -> Result<(), GaleError> {
        task.validate()?;

        self.client.start(&task.id).await?;

        let executor = self
            .executors
            .get(task.kind)
            .ok_or_else(|| GaleError::Validation(format!("no executor for {:?}", task.kind)))?;

        tracing::info!(task_id = %task.id, kind = ?task.kind, "executing task");
        let mut result = executor.execute(cancel, &task).await?;

        result.enrich(&self.identity, &task);
        result.validate()?;

        self.client.save_result(&task.id, &result).await?;
        self.client.complete(&task.id).await?;

        tracing::info!(
            task_id = %task.id,
            exit_code = result.exit_code,
            execution_time_ms = result.execution_time_ms,
            "task completed"
        );
        Ok(())
    }
}

async fn handle_webhook(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(message): Json<WebhookMessage>,
) -> impl IntoResponse {
    if message.kind != "available_tasks" {
        tracing::warn!(kind = %message.kind, "unknown webhook message type");
        return Json(json!({"status": "ok"}));
    }

    let task: Task = match serde_json::from_value(message.payload) {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!("undecodable task payload: {e}");
            return Json(json!({"status": "ok"}));
        }
    };

    let status = dispatcher.admit(task);
    Json(json!({"status": status}))
}
