//! Bounded FIFO of batch jobs with single-flight processing.
//!
//! The FIFO and the job registry share one mutex that is held only for the
//! short sections that read or mutate them, never across a prediction. A
//! one-permit semaphore gates processing so that at most one job is being
//! predicted at any time, however many callers trigger it.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, Semaphore, TryAcquireError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::{PipelineError, Result};
use crate::executor::ParallelExecutor;
use crate::job::{BatchJob, JobId, JobStatus, JobUpdate, PendingJob};
use crate::model::{FeatureVector, PredictionModel, PredictionOutput};
use crate::registry::JobRegistry;

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting in the FIFO
    pub max_queue_size: usize,
    /// Maximum number of feature vectors in one submitted batch
    pub max_batch_size: usize,
    /// Samples per execution unit
    pub chunk_size: usize,
    /// Attach probabilities when the model can estimate them
    pub return_probabilities: bool,
    /// Pause between jobs while draining the FIFO
    #[serde(with = "humantime_serde")]
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_batch_size: 10_000,
            chunk_size: 100,
            return_probabilities: true,
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// Result of one `process_next_job` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was queued
    Idle,
    /// Another call is already processing a job
    Busy,
    Completed(JobId),
    Failed(JobId),
}

/// Point-in-time view of the queue. Counts cover every registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total_jobs: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs waiting in the FIFO
    pub queue_size: usize,
    pub max_queue_size: usize,
}

struct QueueEntry {
    job_id: JobId,
    features: Vec<FeatureVector>,
}

#[derive(Default)]
struct QueueState {
    fifo: VecDeque<QueueEntry>,
    registry: JobRegistry,
}

/// Batch job queue.
///
/// Construct once and share it behind an `Arc` with every caller and with the
/// [`QueueDaemon`](crate::daemon::QueueDaemon).
///
/// # Example
/// ```ignore
/// let executor = Arc::new(ParallelExecutor::new(None, ExecutionMode::Threads));
/// let queue = Arc::new(BatchQueue::new(QueueConfig::default(), executor));
///
/// let job_id = queue.add_job(vec![vec![0.1, 0.2], vec![0.3, 0.4]])?;
/// queue.process_next_job(&model).await?;
/// let job = queue.get_job(&job_id).unwrap();
/// ```
pub struct BatchQueue {
    config: QueueConfig,
    executor: Arc<ParallelExecutor>,
    state: Mutex<QueueState>,
    single_flight: Semaphore,
    updates_tx: broadcast::Sender<JobUpdate>,
    job_added: Notify,
}

impl BatchQueue {
    pub fn new(config: QueueConfig, executor: Arc<ParallelExecutor>) -> Self {
        // Every job produces three updates over its lifetime
        let (updates_tx, _) = broadcast::channel(1024);

        Self {
            config,
            executor,
            state: Mutex::new(QueueState::default()),
            single_flight: Semaphore::new(1),
            updates_tx,
            job_added: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<ParallelExecutor> {
        &self.executor
    }

    /// Submit a batch. Returns the identifier of the new pending job.
    ///
    /// # Errors
    /// - `InvalidBatch` for an empty or oversized batch, or rows of differing
    ///   or zero width
    /// - `CapacityExceeded` when `max_queue_size` jobs are already waiting
    #[tracing::instrument(skip(self, features), fields(samples = features.len()))]
    pub fn add_job(&self, features: Vec<FeatureVector>) -> Result<JobId> {
        validate_batch(&features, self.config.max_batch_size)?;

        let job_id = JobId::new();
        let total_samples = features.len();
        {
            let mut state = self.state.lock();
            if state.fifo.len() >= self.config.max_queue_size {
                tracing::warn!(
                    max_queue_size = self.config.max_queue_size,
                    "Rejecting job, queue is full"
                );
                return Err(PipelineError::CapacityExceeded {
                    max_queue_size: self.config.max_queue_size,
                });
            }

            state.registry.insert(BatchJob::new(job_id, total_samples))?;
            state.fifo.push_back(QueueEntry { job_id, features });
        }

        tracing::info!(%job_id, samples = total_samples, "Job queued");
        self.publish(job_id, JobStatus::Pending);
        self.job_added.notify_one();

        Ok(job_id)
    }

    /// Snapshot of a job, or `None` if it is unknown or was purged.
    pub fn get_job(&self, job_id: &JobId) -> Option<BatchJob> {
        self.state.lock().registry.get(job_id)
    }

    /// Jobs still waiting in the FIFO, head first.
    pub fn get_pending_jobs(&self) -> Vec<PendingJob> {
        self.state
            .lock()
            .fifo
            .iter()
            .map(|entry| PendingJob {
                job_id: entry.job_id,
                samples: entry.features.len(),
            })
            .collect()
    }

    /// Take the head of the FIFO and predict it.
    ///
    /// Prediction failures are recorded on the job and reported as
    /// [`ProcessOutcome::Failed`]. Only registry bookkeeping errors are
    /// returned as `Err`.
    #[tracing::instrument(skip(self, model))]
    pub async fn process_next_job<M>(&self, model: &Arc<M>) -> Result<ProcessOutcome>
    where
        M: PredictionModel + Serialize + DeserializeOwned,
    {
        // Released on every return path when the permit drops
        let _in_flight = match self.single_flight.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!("Another job is being processed");
                return Ok(ProcessOutcome::Busy);
            }
            Err(TryAcquireError::Closed) => {
                return Err(PipelineError::Internal(
                    "single-flight gate closed".to_string(),
                ))
            }
        };

        let (job, features) = {
            let mut state = self.state.lock();
            let Some(QueueEntry { job_id, features }) = state.fifo.pop_front() else {
                return Ok(ProcessOutcome::Idle);
            };
            (state.registry.start(&job_id)?, features)
        };
        let job_id = job.job_id;

        tracing::info!(%job_id, samples = job.total_samples, "Processing job");
        self.publish(job_id, JobStatus::Processing);

        let prediction = self
            .executor
            .predict_parallel(
                model,
                features,
                self.config.chunk_size,
                self.config.return_probabilities,
            )
            .await;

        match prediction {
            Ok(results) => {
                let job = self.record_results(&job_id, results)?;
                tracing::info!(
                    %job_id,
                    processed_samples = job.processed_samples,
                    "Job completed"
                );
                self.publish(job_id, JobStatus::Completed);
                Ok(ProcessOutcome::Completed(job_id))
            }
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Job failed");
                self.state.lock().registry.fail(&job_id, e.to_string())?;
                self.publish(job_id, JobStatus::Failed);
                Ok(ProcessOutcome::Failed(job_id))
            }
        }
    }

    /// Process jobs until the FIFO is empty. Returns how many this call
    /// processed.
    ///
    /// While another caller holds the processing gate this keeps polling at
    /// `drain_interval`, so it only returns once nothing is queued.
    #[tracing::instrument(skip(self, model))]
    pub async fn process_all_jobs<M>(&self, model: &Arc<M>) -> Result<usize>
    where
        M: PredictionModel + Serialize + DeserializeOwned,
    {
        let mut processed = 0;

        loop {
            let queued = self.state.lock().fifo.len();
            if queued == 0 {
                break;
            }

            match self.process_next_job(model).await? {
                ProcessOutcome::Completed(_) | ProcessOutcome::Failed(_) => processed += 1,
                ProcessOutcome::Busy => {}
                ProcessOutcome::Idle => break,
            }

            if self.config.drain_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.drain_interval).await;
            }
        }

        if processed > 0 {
            tracing::info!(processed, "Queue drained");
        }
        Ok(processed)
    }

    pub fn get_statistics(&self) -> QueueStatistics {
        let state = self.state.lock();
        let counts = state.registry.counts();

        QueueStatistics {
            total_jobs: state.registry.len(),
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            queue_size: state.fifo.len(),
            max_queue_size: self.config.max_queue_size,
        }
    }

    /// Remove completed and failed jobs that finished more than
    /// `older_than_minutes` ago. Returns the number removed.
    #[tracing::instrument(skip(self))]
    pub fn clear_completed_jobs(&self, older_than_minutes: u64) -> usize {
        let cutoff = i64::try_from(older_than_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            // Nothing can be that old
            return 0;
        };

        let removed = self.state.lock().registry.purge_terminal_before(cutoff);
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Cleared finished jobs");
        }
        removed.len()
    }

    /// Stream of status changes, optionally limited to some jobs.
    ///
    /// Only changes made after subscribing are delivered. A subscriber that
    /// falls too far behind silently skips the updates it missed.
    pub fn subscribe(
        &self,
        job_ids: Option<Vec<JobId>>,
    ) -> Pin<Box<dyn Stream<Item = JobUpdate> + Send>> {
        let rx = self.updates_tx.subscribe();

        match job_ids {
            Some(ids) => {
                let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
                    Ok(update) if ids.contains(&update.job_id) => Some(update),
                    _ => None,
                });
                Box::pin(stream)
            }
            None => {
                let stream = BroadcastStream::new(rx).filter_map(|result| result.ok());
                Box::pin(stream)
            }
        }
    }

    /// Signalled once per submitted job.
    pub fn job_added(&self) -> &Notify {
        &self.job_added
    }

    /// Store the results of a processed job. If they cannot be stored the job
    /// is failed instead, so it never stays in PROCESSING.
    fn record_results(&self, job_id: &JobId, results: Vec<PredictionOutput>) -> Result<BatchJob> {
        let completed = {
            let mut state = self.state.lock();
            let completed = state.registry.complete(job_id, results);
            if let Err(e) = &completed {
                let _ = state.registry.fail(job_id, e.to_string());
            }
            completed
        };

        if let Err(e) = &completed {
            tracing::error!(%job_id, error = %e, "Failed to record job results");
            self.publish(*job_id, JobStatus::Failed);
        }
        completed
    }

    fn publish(&self, job_id: JobId, status: JobStatus) {
        // No receivers is fine
        let _ = self.updates_tx.send(JobUpdate { job_id, status });
    }
}

fn validate_batch(features: &[FeatureVector], max_batch_size: usize) -> Result<()> {
    let Some(first) = features.first() else {
        return Err(PipelineError::InvalidBatch(
            "batch must contain at least one feature vector".to_string(),
        ));
    };
    if features.len() > max_batch_size {
        return Err(PipelineError::InvalidBatch(format!(
            "batch of {} samples exceeds the limit of {max_batch_size}",
            features.len()
        )));
    }

    let width = first.len();
    if width == 0 {
        return Err(PipelineError::InvalidBatch(
            "feature vectors must not be empty".to_string(),
        ));
    }
    if let Some(index) = features.iter().position(|row| row.len() != width) {
        return Err(PipelineError::InvalidBatch(format!(
            "row {index} has {} features, expected {width}",
            features[index].len()
        )));
    }
    Ok(())
}
