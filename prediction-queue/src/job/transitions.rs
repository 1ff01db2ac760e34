use chrono::Utc;

use crate::error::{PipelineError, Result};
use crate::model::PredictionOutput;

use super::types::{BatchJob, JobId, JobStatus};

impl BatchJob {
    /// Create a fresh pending record for a batch of `total_samples` vectors.
    pub fn new(job_id: JobId, total_samples: usize) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            total_samples,
            processed_samples: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            results: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_status(&self, expected: JobStatus, to: JobStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                job_id: self.job_id,
                from: self.status,
                to,
            })
        }
    }

    /// Pending -> Processing.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_status(JobStatus::Pending, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Processing -> Completed, attaching one result per submitted sample.
    pub fn complete(&mut self, results: Vec<PredictionOutput>) -> Result<()> {
        self.ensure_status(JobStatus::Processing, JobStatus::Completed)?;
        if results.len() != self.total_samples {
            return Err(PipelineError::Internal(format!(
                "job {} produced {} results for {} samples",
                self.job_id,
                results.len(),
                self.total_samples
            )));
        }

        self.status = JobStatus::Completed;
        self.processed_samples = results.len();
        self.completed_at = Some(Utc::now());
        self.results = Some(results);
        Ok(())
    }

    /// Processing -> Failed. No partial results are kept.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_status(JobStatus::Processing, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.results = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Label, PredictionOutput};

    fn outputs(n: usize) -> Vec<PredictionOutput> {
        (0..n)
            .map(|i| PredictionOutput {
                prediction: Label::Class(i as i64),
                probability: None,
                probabilities: None,
                model_version: "test".to_string(),
                timestamp: Utc::now(),
                inference_time_ms: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_happy_path() {
        let mut job = BatchJob::new(JobId::new(), 2);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        job.start().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert_eq!(job.processed_samples, 0);

        job.complete(outputs(2)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_samples, job.total_samples);
        assert_eq!(job.results.as_ref().map(Vec::len), Some(2));
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_fail_records_error_without_results() {
        let mut job = BatchJob::new(JobId::new(), 3);
        job.start().unwrap();
        job.fail("model exploded").unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("model exploded"));
        assert!(job.results.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_no_regression_out_of_terminal_states() {
        let mut job = BatchJob::new(JobId::new(), 1);
        job.start().unwrap();
        job.complete(outputs(1)).unwrap();

        assert!(matches!(
            job.start(),
            Err(PipelineError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Processing,
                ..
            })
        ));
        assert!(job.fail("late").is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_cannot_skip_processing() {
        let mut job = BatchJob::new(JobId::new(), 1);
        assert!(job.complete(outputs(1)).is_err());
        assert!(job.fail("skipped").is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_complete_requires_all_samples() {
        let mut job = BatchJob::new(JobId::new(), 3);
        job.start().unwrap();
        assert!(job.complete(outputs(2)).is_err());
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.results.is_none());
    }
}
