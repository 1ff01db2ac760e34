//! Parallel executor for batch predictions.
//!
//! A batch is split into contiguous chunks, each chunk becomes one execution
//! unit on a fixed-size worker pool, and the per-chunk results are merged back
//! in submission order. Completion order of the units is unconstrained; the
//! merged output always lines up index-for-index with the input batch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{PipelineError, Result};
use crate::model::{FeatureMatrix, FeatureVector, Prediction, PredictionModel, PredictionOutput};

pub mod chunk;
mod isolated;

pub use chunk::{merge_chunks, split_into_chunks};

/// How execution units are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Units run on the blocking thread pool and share one model instance.
    /// Suited to models that mostly wait on I/O.
    #[default]
    Threads,
    /// Units run on dedicated worker threads, each owning a replica of the
    /// model deserialized from a snapshot taken once per call. Suited to
    /// CPU-bound models; nothing is shared between replicas.
    Isolated,
}

/// Executor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Worker count. Defaults to the available parallelism of the host.
    pub max_workers: Option<usize>,
    pub mode: ExecutionMode,
}

/// Runs chunked predictions on a bounded pool of workers.
///
/// # Example
/// ```ignore
/// let executor = ParallelExecutor::new(Some(4), ExecutionMode::Threads);
/// let outputs = executor
///     .predict_parallel(&model, batch, 100, true)
///     .await?;
/// assert_eq!(outputs.len(), batch_len);
/// ```
#[derive(Debug)]
pub struct ParallelExecutor {
    max_workers: usize,
    mode: ExecutionMode,
    /// Caps running units across all concurrent calls
    permits: Arc<Semaphore>,
}

/// Largest pool the executor will build. Isolated mode claims its workers'
/// permits in one `u32` request.
const MAX_WORKERS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ParallelExecutor {
    /// Create an executor. `None` (or zero) workers means one per available core.
    /// Counts beyond what the worker pool can track are clamped.
    pub fn new(max_workers: Option<usize>, mode: ExecutionMode) -> Self {
        let max_workers = max_workers
            .filter(|&n| n > 0)
            .unwrap_or_else(default_workers)
            .min(MAX_WORKERS);

        tracing::info!(max_workers, mode = ?mode, "Parallel executor initialised");

        Self {
            max_workers,
            mode,
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.max_workers, config.mode)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Predict every sample of `batch`, returning one output per sample in
    /// input order.
    ///
    /// The batch is consumed: its chunks move into the execution units. If any
    /// unit fails the whole call fails and no partial results are returned.
    ///
    /// # Errors
    /// - `InvalidBatch` if `chunk_size` is zero
    /// - `ChunkExecution` if any unit fails or panics
    /// - `Json` if the model cannot be snapshotted for isolated workers
    #[tracing::instrument(skip(self, model, batch), fields(samples = batch.len(), mode = ?self.mode))]
    pub async fn predict_parallel<M>(
        &self,
        model: &Arc<M>,
        batch: Vec<FeatureVector>,
        chunk_size: usize,
        return_probabilities: bool,
    ) -> Result<Vec<PredictionOutput>>
    where
        M: PredictionModel + Serialize + DeserializeOwned,
    {
        if chunk_size == 0 {
            return Err(PipelineError::InvalidBatch(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let samples = batch.len();
        let chunks = split_into_chunks(batch, chunk_size);

        tracing::info!(
            samples,
            chunks = chunks.len(),
            chunk_size,
            "Starting parallel prediction"
        );

        let per_chunk = match self.mode {
            ExecutionMode::Threads => {
                self.run_on_threads(model, chunks, return_probabilities)
                    .await?
            }
            ExecutionMode::Isolated => {
                isolated::run(
                    model.as_ref(),
                    chunks,
                    return_probabilities,
                    self.max_workers,
                    self.permits.clone(),
                )
                .await?
            }
        };

        let predictions = merge_chunks(per_chunk);
        if predictions.len() != samples {
            return Err(PipelineError::Internal(format!(
                "merged {} predictions for {samples} samples",
                predictions.len()
            )));
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let per_sample_ms = (elapsed_ms / samples as f64 * 100.0).round() / 100.0;
        let model_version = model.version();
        let timestamp = Utc::now();

        tracing::info!(samples, per_sample_ms, "Parallel prediction complete");

        Ok(predictions
            .into_iter()
            .map(|prediction| PredictionOutput {
                prediction: prediction.prediction,
                probability: prediction.probability,
                probabilities: prediction.probabilities,
                model_version: model_version.clone(),
                timestamp,
                inference_time_ms: per_sample_ms,
            })
            .collect())
    }

    async fn run_on_threads<M: PredictionModel>(
        &self,
        model: &Arc<M>,
        chunks: Vec<Vec<FeatureVector>>,
        return_probabilities: bool,
    ) -> Result<Vec<Vec<Prediction>>> {
        let chunk_count = chunks.len();
        let mut join_set = JoinSet::new();
        let mut chunk_of_task = HashMap::with_capacity(chunk_count);

        for (index, chunk) in chunks.into_iter().enumerate() {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::Internal("worker pool closed".to_string()))?;
            let model = Arc::clone(model);

            let handle = join_set.spawn_blocking(move || {
                // Permit is held for the duration of this unit
                let _permit = permit;
                predict_chunk(model.as_ref(), &chunk, return_probabilities)
            });
            chunk_of_task.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Vec<Prediction>>> = (0..chunk_count).map(|_| None).collect();
        let mut failure: Option<PipelineError> = None;

        // Every unit is joined before returning, including after a failure
        while let Some(joined) = join_set.join_next_with_id().await {
            let (index, message) = match joined {
                Ok((task_id, Ok(predictions))) => {
                    let index = chunk_of_task[&task_id];
                    tracing::trace!(chunk = index, "Chunk completed");
                    slots[index] = Some(predictions);
                    continue;
                }
                Ok((task_id, Err(e))) => (chunk_of_task[&task_id], format!("{e:#}")),
                Err(join_error) if join_error.is_cancelled() && failure.is_some() => continue,
                Err(join_error) => {
                    let index = chunk_of_task[&join_error.id()];
                    let message = if join_error.is_panic() {
                        panic_message(&*join_error.into_panic())
                    } else {
                        join_error.to_string()
                    };
                    (index, message)
                }
            };

            if failure.is_none() {
                // Units that have not started yet are dropped; running ones finish
                join_set.abort_all();
                failure = Some(chunk_failure(index, message));
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        collect_slots(slots)
    }
}

fn chunk_failure(chunk: usize, message: String) -> PipelineError {
    tracing::error!(chunk, error = %message, "Chunk prediction failed");
    PipelineError::ChunkExecution { chunk, message }
}

fn collect_slots(slots: Vec<Option<Vec<Prediction>>>) -> Result<Vec<Vec<Prediction>>> {
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| PipelineError::Internal(format!("chunk {index} produced no result")))
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

/// One execution unit: convert the chunk, predict, and attach probabilities
/// when requested and supported.
fn predict_chunk<M: PredictionModel + ?Sized>(
    model: &M,
    chunk: &[FeatureVector],
    return_probabilities: bool,
) -> anyhow::Result<Vec<Prediction>> {
    let features = FeatureMatrix::from_rows(chunk)?;
    let labels = model.predict(&features)?;
    ensure!(
        labels.len() == features.rows(),
        "model returned {} predictions for {} samples",
        labels.len(),
        features.rows()
    );

    if !(return_probabilities && model.supports_probabilities()) {
        return Ok(labels
            .into_iter()
            .map(|prediction| Prediction {
                prediction,
                probability: None,
                probabilities: None,
            })
            .collect());
    }

    let probabilities = model.predict_proba(&features)?;
    ensure!(
        probabilities.len() == features.rows(),
        "model returned {} probability rows for {} samples",
        probabilities.len(),
        features.rows()
    );

    labels
        .into_iter()
        .zip(probabilities)
        .map(|(prediction, probabilities)| {
            let probability = prediction
                .class_index()
                .and_then(|column| probabilities.get(column).copied())
                .with_context(|| {
                    format!(
                        "prediction {prediction} has no matching column among {} probabilities",
                        probabilities.len()
                    )
                })?;
            Ok(Prediction {
                prediction,
                probability: Some(probability),
                probabilities: Some(probabilities),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests;
