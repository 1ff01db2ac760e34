use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Result type for prediction queue operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur in the prediction pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The FIFO already holds the maximum number of unprocessed jobs
    #[error("Queue is full (max_queue_size = {max_queue_size})")]
    CapacityExceeded { max_queue_size: usize },

    /// Job not found in the registry
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The submitted batch or chunking parameters are unusable
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// A status change that would move a job backwards or skip a state
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// One execution unit failed, aborting the whole batch
    #[error("Chunk {chunk} failed: {message}")]
    ChunkExecution { chunk: usize, message: String },

    /// Model failure outside of a chunk (e.g. loading)
    #[error("Model error: {0}")]
    Model(#[from] anyhow::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
