//! Training execution contract. Concrete trainers (neural network,
//! random forest, linear regression) live outside this crate; what is
//! enforced here is the shared contract and its numeric-stability
//! obligation: NaN or infinity anywhere in the data path is a hard
//! error, never a silent pass-through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::GaleError;
use crate::executor::TaskExecutor;
use crate::model::{PartitionSpec, Task, TaskResult};

#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Load a dataset into feature rows and labels, optionally
    /// restricted to one partition of a federated split.
    async fn load_data(
        &self,
        cancel: CancellationToken,
        dataset: &str,
        format: &str,
        partition: Option<&PartitionSpec>,
    ) -> Result<(Vec<Vec<f64>>, Vec<f64>), GaleError>;
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub weights: Vec<f64>,
    pub loss: f64,
    pub accuracy: f64,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        cancel: CancellationToken,
        features: &[Vec<f64>],
        labels: &[f64],
        epochs: u32,
        batch_size: usize,
        learning_rate: f64,
    ) -> Result<TrainOutcome, GaleError>;
}

/// Reject non-finite values in a slice; `what` names the offending
/// field in the error.
pub fn validate_finite(what: &str, values: &[f64]) -> Result<(), GaleError> {
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        return Err(GaleError::Validation(format!(
            "{what} contains a non-finite value at index {pos}"
        )));
    }
    Ok(())
}

pub fn validate_features(features: &[Vec<f64>]) -> Result<(), GaleError> {
    for (row, values) in features.iter().enumerate() {
        if let Some(col) = values.iter().position(|v| !v.is_finite()) {
            return Err(GaleError::Validation(format!(
                "features contain a non-finite value at row {row}, column {col}"
            )));
        }
    }
    Ok(())
}

/// Training round executor: load, validate, train, validate again.
pub struct TrainingExecutor {
    loader: Arc<dyn DataLoader>,
    trainer: Arc<dyn Trainer>,
}

impl TrainingExecutor {
    pub fn new(loader: Arc<dyn DataLoader>, trainer: Arc<dyn Trainer>) -> Self {
        Self { loader, trainer }
    }
}

#[async_trait]
impl TaskExecutor for TrainingExecutor {
    async fn execute(
        &self,
        cancel: CancellationToken,
        task: &Task,
    ) -> Result<TaskResult, GaleError> {
        let cfg = &task.config;
        let dataset = cfg.dataset.as_deref().ok_or_else(|| {
            GaleError::Validation(format!("training task {} has no dataset", task.id))
        })?;
        let format = cfg.data_format.as_deref().unwrap_or("csv");

        let start = std::time::Instant::now();
        let (features, labels) = self
            .loader
            .load_data(cancel.clone(), dataset, format, cfg.partition.as_ref())
            .await?;

        if features.len() != labels.len() {
            return Err(GaleError::Validation(format!(
                "feature rows ({}) and labels ({}) differ in length",
                features.len(),
                labels.len()
            )));
        }
        validate_features(&features)?;
        validate_finite("labels", &labels)?;

        let outcome = self
            .trainer
            .train(
                cancel,
                &features,
                &labels,
                cfg.epochs,
                cfg.batch_size,
                cfg.learning_rate,
            )
            .await?;

        if !outcome.loss.is_finite() {
            return Err(GaleError::Validation("training loss is non-finite".into()));
        }
        if !outcome.accuracy.is_finite() {
            return Err(GaleError::Validation("training accuracy is non-finite".into()));
        }
        validate_finite("weights", &outcome.weights)?;

        let mut result = TaskResult::new(&task.id);
        result.exit_code = 0;
        result.execution_time_ms = start.elapsed().as_millis() as u64;

        let mut metadata = HashMap::new();
        metadata.insert("loss".to_string(), json!(outcome.loss));
        metadata.insert("accuracy".to_string(), json!(outcome.accuracy));
        metadata.insert("weights".to_string(), json!(outcome.weights));
        metadata.insert("samples".to_string(), json!(labels.len()));
        result.metadata = Some(metadata);

        Ok(result)
    }
}
