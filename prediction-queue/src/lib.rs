//! Asynchronous batch-prediction queue.
//!
//! This crate provides a batch prediction pipeline that:
//! - Accepts batches of feature vectors into a bounded FIFO
//! - Processes one job at a time behind a single-flight gate
//! - Splits each batch into chunks predicted in parallel by a worker pool
//! - Merges chunk results back in input order, all-or-nothing per batch
//! - Tracks every job through a monotonic lifecycle until it is purged
//!
//! # Example
//! ```ignore
//! use prediction_queue::{BatchQueue, ExecutionMode, LinearModel, ParallelExecutor, QueueConfig};
//!
//! let model = Arc::new(LinearModel::load("model.json")?);
//! let executor = Arc::new(ParallelExecutor::new(None, ExecutionMode::Threads));
//! let queue = Arc::new(BatchQueue::new(QueueConfig::default(), executor));
//!
//! // Submit a batch
//! let job_id = queue.add_job(vec![vec![5.1, 3.5], vec![6.2, 2.9]])?;
//!
//! // Process it (normally done by a QueueDaemon)
//! queue.process_all_jobs(&model).await?;
//!
//! // Check status
//! let job = queue.get_job(&job_id);
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod job;
pub mod model;
pub mod queue;
pub mod registry;
pub mod telemetry;

// Re-export commonly used types
pub use daemon::{DaemonConfig, QueueDaemon};
pub use error::{PipelineError, Result};
pub use executor::{ExecutionMode, ExecutorConfig, ParallelExecutor};
pub use job::*;
pub use model::{
    FeatureMatrix, FeatureVector, Label, LinearModel, MockModel, PredictionModel, PredictionOutput,
};
pub use queue::{BatchQueue, ProcessOutcome, QueueConfig, QueueStatistics};
pub use registry::JobRegistry;
