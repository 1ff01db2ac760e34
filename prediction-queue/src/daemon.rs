//! Background triggers for draining the queue and purging finished jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::model::PredictionModel;
use crate::queue::{BatchQueue, ProcessOutcome};

/// Configuration for the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Fallback drain tick, on top of waking for every submission
    #[serde(with = "humantime_serde")]
    pub process_interval: Duration,

    /// How often finished jobs are purged
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// How long finished jobs stay queryable, in whole minutes
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Interval for logging queue statistics. `None` disables it.
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(60 * 60),
            status_log_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Drives a [`BatchQueue`] until its shutdown token is cancelled.
///
/// A job that is being predicted when shutdown is requested runs to
/// completion; jobs still in the FIFO stay there.
pub struct QueueDaemon<M> {
    queue: Arc<BatchQueue>,
    model: Arc<M>,
    config: DaemonConfig,
    shutdown: CancellationToken,
}

impl<M> QueueDaemon<M>
where
    M: PredictionModel + Serialize + DeserializeOwned,
{
    pub fn new(
        queue: Arc<BatchQueue>,
        model: Arc<M>,
        config: DaemonConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            model,
            config,
            shutdown,
        }
    }

    /// Run the daemon as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    pub async fn run(self) {
        info!(
            process_interval = ?self.config.process_interval,
            cleanup_interval = ?self.config.cleanup_interval,
            retention = ?self.config.retention,
            "Queue daemon started"
        );

        let mut process_tick = ticker(self.config.process_interval);
        let mut cleanup_tick = ticker(self.config.cleanup_interval);
        let mut status_tick = self.config.status_log_interval.map(ticker);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Queue daemon shutting down");
                    break;
                }
                _ = self.queue.job_added().notified() => self.drain().await,
                _ = process_tick.tick() => self.drain().await,
                _ = cleanup_tick.tick() => self.cleanup(),
                _ = next_tick(&mut status_tick) => self.log_status(),
            }
        }
    }

    /// Process jobs one at a time until the FIFO is empty or shutdown is requested.
    async fn drain(&self) {
        let mut processed = 0usize;

        while !self.shutdown.is_cancelled() {
            match self.queue.process_next_job(&self.model).await {
                Ok(ProcessOutcome::Completed(_) | ProcessOutcome::Failed(_)) => processed += 1,
                Ok(ProcessOutcome::Idle) => break,
                Ok(ProcessOutcome::Busy) => {
                    debug!("Queue busy, skipping drain");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to process job");
                    break;
                }
            }

            let pause = self.queue.config().drain_interval;
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }

        if processed > 0 {
            debug!(processed, "Drain finished");
        }
    }

    fn cleanup(&self) {
        let minutes = self.config.retention.as_secs() / 60;
        let removed = self.queue.clear_completed_jobs(minutes);
        debug!(removed, retention_minutes = minutes, "Cleanup pass finished");
    }

    fn log_status(&self) {
        let stats = self.queue.get_statistics();
        info!(
            total_jobs = stats.total_jobs,
            pending = stats.pending,
            processing = stats.processing,
            completed = stats.completed,
            failed = stats.failed,
            queue_size = stats.queue_size,
            max_queue_size = stats.max_queue_size,
            "Queue status"
        );
    }
}

fn ticker(period: Duration) -> Interval {
    // interval() panics on a zero period
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionMode, ParallelExecutor};
    use crate::job::{JobId, JobStatus};
    use crate::model::MockModel;
    use crate::queue::QueueConfig;

    fn queue() -> Arc<BatchQueue> {
        let executor = Arc::new(ParallelExecutor::new(Some(2), ExecutionMode::Threads));
        Arc::new(BatchQueue::new(
            QueueConfig {
                drain_interval: Duration::ZERO,
                ..QueueConfig::default()
            },
            executor,
        ))
    }

    async fn wait_for(what: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn status(queue: &BatchQueue, job_id: &JobId) -> Option<JobStatus> {
        queue.get_job(job_id).map(|job| job.status)
    }

    #[test_log::test(tokio::test)]
    async fn test_daemon_processes_submitted_jobs() {
        let queue = queue();
        let shutdown = CancellationToken::new();
        let config = DaemonConfig {
            // Only submission wake-ups can trigger processing
            process_interval: Duration::from_secs(3600),
            status_log_interval: None,
            ..DaemonConfig::default()
        };
        let handle = QueueDaemon::new(
            queue.clone(),
            Arc::new(MockModel::new()),
            config,
            shutdown.clone(),
        )
        .spawn();

        let first = queue.add_job(vec![vec![1.0], vec![2.0]]).unwrap();
        let second = queue.add_job(vec![vec![3.0]]).unwrap();

        wait_for(|| {
            status(&queue, &first) == Some(JobStatus::Completed)
                && status(&queue, &second) == Some(JobStatus::Completed)
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_daemon_purges_finished_jobs() {
        let queue = queue();
        let shutdown = CancellationToken::new();
        let config = DaemonConfig {
            process_interval: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(20),
            retention: Duration::ZERO,
            status_log_interval: Some(Duration::from_millis(20)),
        };
        let model = Arc::new(MockModel::new().failing_on(7));
        let handle = QueueDaemon::new(queue.clone(), model, config, shutdown.clone()).spawn();

        let done = queue.add_job(vec![vec![1.0]]).unwrap();
        let failed = queue.add_job(vec![vec![7.0]]).unwrap();

        wait_for(|| queue.get_job(&done).is_none() && queue.get_job(&failed).is_none()).await;
        assert_eq!(queue.get_statistics().total_jobs, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_daemon_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let handle = QueueDaemon::new(
            queue(),
            Arc::new(MockModel::new()),
            DaemonConfig::default(),
            shutdown.clone(),
        )
        .spawn();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("daemon did not stop")
            .unwrap();
    }

    #[test]
    fn test_config_parses_humantime_durations() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{"process_interval": "250ms", "retention": "2h", "status_log_interval": null}"#,
        )
        .unwrap();

        assert_eq!(config.process_interval, Duration::from_millis(250));
        assert_eq!(config.retention, Duration::from_secs(2 * 60 * 60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(5 * 60));
        assert!(config.status_log_interval.is_none());
    }
}
