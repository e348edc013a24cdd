//! Uniform execution contract over the task kinds. Implementations are
//! selected by kind; the dispatcher only ever sees `TaskExecutor`.

pub mod llm;
pub mod shell;
pub mod training;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::GaleError;
use crate::model::{Task, TaskKind, TaskResult};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute one task to completion or failure. Implementations must
    /// observe `cancel` at every blocking point; an executor may fail
    /// without producing a result.
    async fn execute(&self, cancel: CancellationToken, task: &Task) -> Result<TaskResult, GaleError>;
}

/// Kind-keyed executor lookup. The embedding application registers
/// external executors (container, trainers) here next to the built-in
/// shell and LLM ones.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.executors.keys().copied().collect()
    }
}
