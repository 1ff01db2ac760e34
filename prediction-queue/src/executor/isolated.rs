//! Isolated execution: dedicated worker threads with private model replicas.
//!
//! The model is serialized once per call. Each worker deserializes its own
//! replica on first use and then only receives chunks over a channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc as async_mpsc, Semaphore};

use crate::error::{PipelineError, Result};
use crate::model::{FeatureVector, Prediction, PredictionModel};

use super::{chunk_failure, collect_slots, panic_message, predict_chunk};

type ChunkResult = (usize, std::result::Result<Vec<Prediction>, String>);

pub(super) async fn run<M>(
    model: &M,
    chunks: Vec<Vec<FeatureVector>>,
    return_probabilities: bool,
    max_workers: usize,
    permits: Arc<Semaphore>,
) -> Result<Vec<Vec<Prediction>>>
where
    M: PredictionModel + Serialize + DeserializeOwned,
{
    let chunk_count = chunks.len();
    let workers = max_workers.min(chunk_count).max(1);
    let snapshot: Arc<[u8]> = serde_json::to_vec(model)?.into();

    let permit_count = u32::try_from(workers)
        .map_err(|_| PipelineError::Internal(format!("cannot reserve {workers} workers")))?;
    let _permits = permits
        .acquire_many_owned(permit_count)
        .await
        .map_err(|_| PipelineError::Internal("worker pool closed".to_string()))?;

    let (chunk_tx, chunk_rx) = mpsc::channel::<(usize, Vec<FeatureVector>)>();
    for item in chunks.into_iter().enumerate() {
        chunk_tx
            .send(item)
            .map_err(|_| PipelineError::Internal("chunk channel closed".to_string()))?;
    }
    drop(chunk_tx);
    let chunk_rx = Arc::new(Mutex::new(chunk_rx));

    let (result_tx, mut result_rx) = async_mpsc::unbounded_channel::<ChunkResult>();

    // Tell workers to stop picking up chunks once we stop listening
    let stop = Arc::new(AtomicBool::new(false));
    let _stop_on_exit = scopeguard::guard(stop.clone(), |stop| {
        stop.store(true, Ordering::SeqCst);
    });

    tracing::debug!(workers, snapshot_bytes = snapshot.len(), "Spawning isolated workers");

    let mut failure: Option<PipelineError> = None;
    for worker in 0..workers {
        let snapshot = snapshot.clone();
        let chunk_rx = chunk_rx.clone();
        let result_tx = result_tx.clone();
        let worker_stop = stop.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("predict-worker-{worker}"))
            .spawn(move || {
                worker_loop::<M>(
                    &snapshot,
                    &chunk_rx,
                    &result_tx,
                    &worker_stop,
                    return_probabilities,
                )
            });
        if let Err(e) = spawned {
            stop.store(true, Ordering::SeqCst);
            failure = Some(PipelineError::Internal(format!(
                "failed to spawn worker thread: {e}"
            )));
            break;
        }
    }
    drop(result_tx);

    let mut slots: Vec<Option<Vec<Prediction>>> = (0..chunk_count).map(|_| None).collect();
    let mut received = 0;

    // The channel closes once every worker has exited, so draining it to the
    // end means no replica is still predicting when this returns
    while let Some((index, result)) = result_rx.recv().await {
        match result {
            Ok(predictions) => {
                tracing::trace!(chunk = index, "Chunk completed");
                slots[index] = Some(predictions);
                received += 1;
            }
            Err(message) => {
                if failure.is_none() {
                    stop.store(true, Ordering::SeqCst);
                    failure = Some(chunk_failure(index, message));
                }
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if received < chunk_count {
        return Err(PipelineError::Internal(
            "isolated workers exited before every chunk was predicted".to_string(),
        ));
    }

    collect_slots(slots)
}

fn worker_loop<M>(
    snapshot: &[u8],
    chunks: &Mutex<mpsc::Receiver<(usize, Vec<FeatureVector>)>>,
    results: &async_mpsc::UnboundedSender<ChunkResult>,
    stop: &AtomicBool,
    return_probabilities: bool,
) where
    M: PredictionModel + DeserializeOwned,
{
    let mut replica: Option<M> = None;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let next = chunks.lock().recv();
        let Ok((index, chunk)) = next else {
            break;
        };

        if replica.is_none() {
            match serde_json::from_slice::<M>(snapshot) {
                Ok(model) => replica = Some(model),
                Err(e) => {
                    let _ = results.send((index, Err(format!("failed to load model replica: {e}"))));
                    break;
                }
            }
        }
        let Some(model) = replica.as_ref() else {
            break;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            predict_chunk(model, &chunk, return_probabilities)
        }));
        let result = match outcome {
            Ok(Ok(predictions)) => Ok(predictions),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(payload) => Err(panic_message(&*payload)),
        };

        if results.send((index, result)).is_err() {
            // Caller gave up on this batch
            break;
        }
    }
}
