use std::sync::Arc;

use rstest::rstest;

use super::*;
use crate::model::{Label, LinearModel, MockModel};

/// Rows whose first feature is their index, so echoed labels reveal ordering
fn indexed_batch(n: usize) -> Vec<FeatureVector> {
    (0..n).map(|i| vec![i as f64, 1.0]).collect()
}

fn echoed(outputs: &[PredictionOutput]) -> Vec<f64> {
    outputs
        .iter()
        .map(|output| match output.prediction {
            Label::Value(value) => value,
            Label::Class(class) => class as f64,
        })
        .collect()
}

#[rstest]
#[case(ExecutionMode::Threads)]
#[case(ExecutionMode::Isolated)]
#[tokio::test]
async fn test_output_matches_input_order(#[case] mode: ExecutionMode) {
    let executor = ParallelExecutor::new(Some(4), mode);
    let model = Arc::new(MockModel::new());

    let outputs = executor
        .predict_parallel(&model, indexed_batch(25), 4, false)
        .await
        .unwrap();

    let expected: Vec<f64> = (0..25).map(|i| i as f64).collect();
    assert_eq!(echoed(&outputs), expected);
    assert!(outputs.iter().all(|output| output.model_version == "mock"));
}

#[tokio::test]
async fn test_order_survives_out_of_order_completion() {
    let executor = ParallelExecutor::new(Some(4), ExecutionMode::Threads);
    // Chunks start at 0, 3, 6, 9; the first two are held back
    let model = Arc::new(
        MockModel::new()
            .with_chunk_latency(0, 150)
            .with_chunk_latency(3, 75),
    );

    let outputs = executor
        .predict_parallel(&model, indexed_batch(10), 3, false)
        .await
        .unwrap();

    let completion = model.completion_order();
    assert_eq!(completion.len(), 4);
    assert_eq!(completion.last(), Some(&0));
    assert_ne!(completion, vec![0, 3, 6, 9]);

    let expected: Vec<f64> = (0..10).map(|i| i as f64).collect();
    assert_eq!(echoed(&outputs), expected);
}

#[tokio::test]
async fn test_worker_count_caps_running_units() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);
    let model = Arc::new(MockModel::new().with_latency(20));

    let outputs = executor
        .predict_parallel(&model, indexed_batch(16), 2, false)
        .await
        .unwrap();

    assert_eq!(outputs.len(), 16);
    assert_eq!(model.invocations(), 8);
    assert!(model.max_concurrent() <= 2);
}

#[rstest]
#[case(ExecutionMode::Threads)]
#[case(ExecutionMode::Isolated)]
#[tokio::test]
async fn test_failing_chunk_fails_whole_batch(#[case] mode: ExecutionMode) {
    let executor = ParallelExecutor::new(Some(3), mode);
    let model = Arc::new(MockModel::new().failing_on(7));

    let err = executor
        .predict_parallel(&model, indexed_batch(12), 5, false)
        .await
        .unwrap_err();

    match err {
        PipelineError::ChunkExecution { chunk, message } => {
            assert_eq!(chunk, 1);
            assert!(message.contains("rejected sample 7"), "{message}");
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
}

#[rstest]
#[case(ExecutionMode::Threads)]
#[case(ExecutionMode::Isolated)]
#[tokio::test]
async fn test_failure_waits_for_running_chunks(#[case] mode: ExecutionMode) {
    let executor = ParallelExecutor::new(Some(2), mode);
    // Chunk 0 fails after 20ms while chunk 2 is still busy for 250ms
    let model = Arc::new(
        MockModel::new()
            .failing_on(0)
            .with_chunk_latency(0, 20)
            .with_chunk_latency(2, 250),
    );

    let started = std::time::Instant::now();
    let err = executor
        .predict_parallel(&model, indexed_batch(4), 2, false)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ChunkExecution { chunk: 0, .. }));
    assert!(started.elapsed() >= std::time::Duration::from_millis(250));
    if mode == ExecutionMode::Threads {
        assert_eq!(model.completion_order(), vec![2]);
    }

    // Every permit came back, so the whole pool is free again
    assert_eq!(executor.permits.available_permits(), 2);
}

#[test]
fn test_worker_count_is_clamped() {
    let executor = ParallelExecutor::new(Some(usize::MAX), ExecutionMode::Isolated);
    assert_eq!(executor.max_workers(), MAX_WORKERS);
    assert!(executor.max_workers() <= u32::MAX as usize);
}

#[rstest]
#[case(ExecutionMode::Threads)]
#[case(ExecutionMode::Isolated)]
#[tokio::test]
async fn test_panicking_chunk_is_reported(#[case] mode: ExecutionMode) {
    let executor = ParallelExecutor::new(Some(2), mode);
    let model = Arc::new(MockModel::new().panicking_on(4));

    let err = executor
        .predict_parallel(&model, indexed_batch(6), 2, false)
        .await
        .unwrap_err();

    match err {
        PipelineError::ChunkExecution { chunk, message } => {
            assert_eq!(chunk, 2);
            assert!(message.contains("panicked on 4"), "{message}");
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_probabilities_attached_when_supported() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);
    let model = Arc::new(
        LinearModel::new("v3", vec![vec![-1.0, 0.0], vec![1.0, 0.0]], vec![0.0, 0.0]).unwrap(),
    );
    let batch = vec![vec![2.0, 0.0], vec![-3.0, 0.0], vec![0.5, 9.0]];

    let outputs = executor
        .predict_parallel(&model, batch, 2, true)
        .await
        .unwrap();

    let labels: Vec<Label> = outputs.iter().map(|output| output.prediction).collect();
    assert_eq!(labels, vec![Label::Class(1), Label::Class(0), Label::Class(1)]);

    for output in &outputs {
        let probabilities = output.probabilities.as_ref().unwrap();
        assert_eq!(probabilities.len(), 2);
        let column = output.prediction.class_index().unwrap();
        assert_eq!(output.probability, Some(probabilities[column]));
        assert_eq!(output.model_version, "v3");
        assert!(output.inference_time_ms >= 0.0);
    }
}

#[tokio::test]
async fn test_probabilities_omitted_when_not_requested_or_unsupported() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);

    let linear = Arc::new(LinearModel::new("v1", vec![vec![1.0], vec![-1.0]], vec![0.0, 0.0]).unwrap());
    let outputs = executor
        .predict_parallel(&linear, vec![vec![1.0]], 10, false)
        .await
        .unwrap();
    assert!(outputs[0].probability.is_none());
    assert!(outputs[0].probabilities.is_none());

    // Requested, but the mock has no probability estimate
    let mock = Arc::new(MockModel::new());
    let outputs = executor
        .predict_parallel(&mock, indexed_batch(3), 10, true)
        .await
        .unwrap();
    assert!(outputs.iter().all(|output| output.probabilities.is_none()));
}

#[tokio::test]
async fn test_isolated_mode_uses_replicas() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Isolated);
    let model = Arc::new(MockModel::new());

    let outputs = executor
        .predict_parallel(&model, indexed_batch(9), 3, false)
        .await
        .unwrap();

    assert_eq!(outputs.len(), 9);
    // Predictions ran against deserialized copies, never the shared instance
    assert_eq!(model.invocations(), 0);
}

#[tokio::test]
async fn test_empty_batch_yields_no_outputs() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);
    let model = Arc::new(MockModel::new());

    let outputs = executor
        .predict_parallel(&model, Vec::new(), 10, true)
        .await
        .unwrap();

    assert!(outputs.is_empty());
    assert_eq!(model.invocations(), 0);
}

#[tokio::test]
async fn test_zero_chunk_size_is_rejected() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);
    let model = Arc::new(MockModel::new());

    let err = executor
        .predict_parallel(&model, indexed_batch(3), 0, false)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidBatch(_)));
}

#[tokio::test]
async fn test_ragged_chunk_fails() {
    let executor = ParallelExecutor::new(Some(2), ExecutionMode::Threads);
    let model = Arc::new(MockModel::new());
    let batch = vec![vec![0.0, 1.0], vec![1.0], vec![2.0, 1.0]];

    let err = executor
        .predict_parallel(&model, batch, 3, false)
        .await
        .unwrap_err();

    match err {
        PipelineError::ChunkExecution { chunk, message } => {
            assert_eq!(chunk, 0);
            assert!(message.contains("row 1"), "{message}");
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
}

#[test]
fn test_default_worker_count() {
    let executor = ParallelExecutor::new(None, ExecutionMode::Threads);
    assert!(executor.max_workers() >= 1);

    let executor = ParallelExecutor::from_config(&ExecutorConfig {
        max_workers: Some(0),
        mode: ExecutionMode::Isolated,
    });
    assert!(executor.max_workers() >= 1);
    assert_eq!(executor.mode(), ExecutionMode::Isolated);
}
