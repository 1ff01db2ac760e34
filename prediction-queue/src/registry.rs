//! Job registry: the authoritative record of every job until it is purged.
//!
//! The registry is plain data. Locking is the owner's concern; the queue keeps
//! it behind the same mutex as its FIFO.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::job::{BatchJob, JobId, JobStatus};
use crate::model::PredictionOutput;

/// Number of registry entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, BatchJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new record. Identifiers are never reused.
    pub fn insert(&mut self, job: BatchJob) -> Result<()> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(PipelineError::Internal(format!(
                "job {} is already registered",
                job.job_id
            )));
        }
        self.jobs.insert(job.job_id, job);
        Ok(())
    }

    /// Snapshot of a job.
    pub fn get(&self, job_id: &JobId) -> Option<BatchJob> {
        self.jobs.get(job_id).cloned()
    }

    pub fn start(&mut self, job_id: &JobId) -> Result<BatchJob> {
        let job = self.job_mut(job_id)?;
        job.start()?;
        Ok(job.clone())
    }

    pub fn complete(&mut self, job_id: &JobId, results: Vec<PredictionOutput>) -> Result<BatchJob> {
        let job = self.job_mut(job_id)?;
        job.complete(results)?;
        Ok(job.clone())
    }

    pub fn fail(&mut self, job_id: &JobId, error: impl Into<String>) -> Result<BatchJob> {
        let job = self.job_mut(job_id)?;
        job.fail(error)?;
        Ok(job.clone())
    }

    /// Remove terminal jobs that completed strictly before `cutoff`.
    ///
    /// Pending and processing jobs are kept whatever their age, as are
    /// terminal jobs without a completion timestamp.
    pub fn purge_terminal_before(&mut self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.is_terminal())
            .filter(|job| job.completed_at.is_some_and(|at| at < cutoff))
            .map(|job| job.job_id)
            .collect();

        for job_id in &expired {
            self.jobs.remove(job_id);
        }
        expired
    }

    pub fn counts(&self) -> StatusCounts {
        self.jobs
            .values()
            .fold(StatusCounts::default(), |mut counts, job| {
                match job.status {
                    JobStatus::Pending => counts.pending += 1,
                    JobStatus::Processing => counts.processing += 1,
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn job_mut(&mut self, job_id: &JobId) -> Result<&mut BatchJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or(PipelineError::JobNotFound(*job_id))
    }
}
