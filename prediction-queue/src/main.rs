use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use prediction_queue::config::{Args, Config};
use prediction_queue::{
    telemetry, BatchQueue, FeatureVector, JobId, JobUpdate, LinearModel, ParallelExecutor,
    PipelineError, QueueDaemon,
};

/// Pause before resubmitting a batch the full queue rejected
const RETRY_FULL_QUEUE_AFTER: Duration = Duration::from_millis(50);

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

/// Submit every line of a JSON-lines file as one job.
///
/// Lines that fail to parse or validate are logged and skipped. A full queue
/// is retried until the daemon frees a slot.
async fn submit_batches(queue: &BatchQueue, path: &Path) -> anyhow::Result<Vec<JobId>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read input file {}", path.display()))?;

    let mut job_ids = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let features: Vec<FeatureVector> = match serde_json::from_str(line) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(line = line_number, error = %e, "Skipping unparseable batch");
                continue;
            }
        };

        loop {
            match queue.add_job(features.clone()) {
                Ok(job_id) => {
                    job_ids.push(job_id);
                    break;
                }
                Err(PipelineError::CapacityExceeded { .. }) => {
                    tokio::time::sleep(RETRY_FULL_QUEUE_AFTER).await;
                }
                Err(e) => {
                    tracing::warn!(line = line_number, error = %e, "Skipping rejected batch");
                    break;
                }
            }
        }
    }

    tracing::info!(submitted = job_ids.len(), "Input submitted");
    Ok(job_ids)
}

/// Wait until every job in `job_ids` has reached a terminal state.
async fn wait_for_jobs(
    queue: &BatchQueue,
    mut updates: impl Stream<Item = JobUpdate> + Unpin,
    job_ids: &[JobId],
) {
    let is_finished = |job_id: &JobId| {
        queue
            .get_job(job_id)
            .map_or(true, |job| job.is_terminal())
    };
    let mut remaining: HashSet<JobId> = job_ids.iter().copied().collect();
    // Updates can be missed by a lagging subscriber, so re-check now and then
    let mut recheck = tokio::time::interval(Duration::from_secs(1));

    while !remaining.is_empty() {
        tokio::select! {
            update = updates.next() => match update {
                Some(update) if update.status.is_terminal() => {
                    remaining.remove(&update.job_id);
                }
                Some(_) => {}
                None => break,
            },
            _ = recheck.tick() => remaining.retain(|job_id| !is_finished(job_id)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry()?;

    tracing::debug!("{:?}", args);

    let model = Arc::new(LinearModel::load(&config.model_path)?);
    let executor = Arc::new(ParallelExecutor::from_config(&config.executor));
    let queue = Arc::new(BatchQueue::new(config.queue.clone(), executor));

    let shutdown = CancellationToken::new();
    let daemon = QueueDaemon::new(
        queue.clone(),
        model,
        config.daemon.clone(),
        shutdown.clone(),
    )
    .spawn();

    match &args.input {
        Some(path) => {
            // Subscribe first so no transition is missed
            let updates = queue.subscribe(None);
            let job_ids = submit_batches(&queue, path).await?;

            tokio::select! {
                _ = wait_for_jobs(&queue, updates, &job_ids) => {}
                _ = shutdown_signal() => {}
            }

            for job_id in &job_ids {
                if let Some(job) = queue.get_job(job_id) {
                    println!("{}", serde_json::to_string(&job)?);
                }
            }
        }
        None => {
            tracing::info!("No input given, serving until shutdown");
            shutdown_signal().await;
        }
    }

    shutdown.cancel();
    daemon.await.context("queue daemon panicked")?;

    let stats = queue.get_statistics();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        pending = stats.pending,
        "Shutdown complete"
    );

    Ok(())
}
