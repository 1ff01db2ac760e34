//! Configurable model double for tests and demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{FeatureMatrix, Label, PredictionModel};

/// Mock model that echoes the first feature of every row as its prediction.
///
/// Chunks are identified by the first feature of their first row, which lets
/// tests delay or fail specific chunks. Call statistics are shared between
/// clones but not serialized, so replicas built by the isolated executor
/// start with fresh counters.
///
/// # Example
/// ```ignore
/// let model = MockModel::new()
///     .with_chunk_latency(0, 50) // the chunk starting at row value 0 finishes last
///     .failing_on(13);           // any chunk containing 13 fails
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockModel {
    /// Latency applied to every predict call
    pub latency_ms: u64,
    /// Extra latency keyed by the first feature of a chunk's first row
    pub chunk_latency_ms: HashMap<i64, u64>,
    /// Return an error for any chunk containing a row starting with this value
    pub fail_on: Option<i64>,
    /// Panic for any chunk containing a row starting with this value
    pub panic_on: Option<i64>,
    #[serde(skip)]
    calls: Arc<MockCalls>,
}

#[derive(Debug, Default)]
struct MockCalls {
    invocations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completed_chunks: Mutex<Vec<i64>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_chunk_latency(mut self, first_value: i64, latency_ms: u64) -> Self {
        self.chunk_latency_ms.insert(first_value, latency_ms);
        self
    }

    pub fn failing_on(mut self, value: i64) -> Self {
        self.fail_on = Some(value);
        self
    }

    pub fn panicking_on(mut self, value: i64) -> Self {
        self.panic_on = Some(value);
        self
    }

    /// Number of `predict` calls made so far.
    pub fn invocations(&self) -> usize {
        self.calls.invocations.load(Ordering::SeqCst)
    }

    /// Highest number of `predict` calls observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.calls.max_active.load(Ordering::SeqCst)
    }

    /// Chunk keys in the order their `predict` calls returned successfully.
    pub fn completion_order(&self) -> Vec<i64> {
        self.calls.completed_chunks.lock().clone()
    }
}

impl PredictionModel for MockModel {
    fn version(&self) -> String {
        "mock".to_string()
    }

    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<Label>> {
        self.calls.invocations.fetch_add(1, Ordering::SeqCst);
        let active = self.calls.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.max_active.fetch_max(active, Ordering::SeqCst);
        let _active = scopeguard::guard((), |_| {
            self.calls.active.fetch_sub(1, Ordering::SeqCst);
        });

        let chunk_key = features.row(0)[0] as i64;
        let latency = self.latency_ms + self.chunk_latency_ms.get(&chunk_key).copied().unwrap_or(0);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }

        let firsts: Vec<i64> = features.iter_rows().map(|row| row[0] as i64).collect();
        if let Some(value) = self.panic_on.filter(|v| firsts.contains(v)) {
            panic!("mock model panicked on {value}");
        }
        if let Some(value) = self.fail_on.filter(|v| firsts.contains(v)) {
            anyhow::bail!("mock model rejected sample {value}");
        }

        self.calls.completed_chunks.lock().push(chunk_key);
        Ok(features
            .iter_rows()
            .map(|row| Label::Value(f64::from(row[0])))
            .collect())
    }
}
