//! Prediction model abstraction.
//!
//! This module defines the `PredictionModel` trait consumed by the executor,
//! the fixed-precision feature matrix handed to models, and the per-sample
//! output types produced by a batch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub mod linear;
pub mod mock;

pub use linear::LinearModel;
pub use mock::MockModel;

/// One submitted sample.
pub type FeatureVector = Vec<f64>;

/// Row-major, contiguous `f32` matrix built from a chunk of feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl FeatureMatrix {
    /// Convert a chunk into a matrix, rejecting empty chunks and ragged rows.
    pub fn from_rows(rows: &[FeatureVector]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(PipelineError::InvalidBatch(
                "cannot build a feature matrix from zero rows".to_string(),
            ));
        };
        let cols = first.len();
        if cols == 0 {
            return Err(PipelineError::InvalidBatch(
                "feature vectors must not be empty".to_string(),
            ));
        }

        let mut data = Vec::with_capacity(rows.len() * cols);
        for (index, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(PipelineError::InvalidBatch(format!(
                    "row {index} has {} features, expected {cols}",
                    row.len()
                )));
            }
            data.extend(row.iter().map(|&value| value as f32));
        }

        Ok(Self {
            data,
            rows: rows.len(),
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.cols)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Predicted class or regression value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Class(i64),
    Value(f64),
}

impl Label {
    /// Column of the probability vector that belongs to this prediction.
    ///
    /// Regression values only map onto a column when they are non-negative
    /// whole numbers.
    pub fn class_index(&self) -> Option<usize> {
        match *self {
            Label::Class(class) => usize::try_from(class).ok(),
            Label::Value(value) if value >= 0.0 && value.fract() == 0.0 && value.is_finite() => {
                Some(value as usize)
            }
            Label::Value(_) => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Class(class) => write!(f, "{class}"),
            Label::Value(value) => write!(f, "{value}"),
        }
    }
}

/// Prediction for a single sample as produced inside an execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub prediction: Label,
    /// Probability of the predicted class
    pub probability: Option<f32>,
    /// Full probability vector
    pub probabilities: Option<Vec<f32>>,
}

/// Per-sample result stored on a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutput {
    pub prediction: Label,
    /// Probability of the predicted class, when the model estimates probabilities
    pub probability: Option<f32>,
    /// Probability per class, when the model estimates probabilities
    pub probabilities: Option<Vec<f32>>,
    pub model_version: String,
    pub timestamp: DateTime<Utc>,
    /// Average inference time per sample across the whole batch
    pub inference_time_ms: f64,
}

/// A pure, side-effect-free predictor.
///
/// Models are shared between worker threads, and the isolated execution mode
/// additionally requires them to serialize so each worker can own a replica.
///
/// # Example
/// ```ignore
/// let model = LinearModel::load("model.json")?;
/// let matrix = FeatureMatrix::from_rows(&[vec![0.1, 0.2]])?;
/// let labels = model.predict(&matrix)?;
/// ```
pub trait PredictionModel: Send + Sync + 'static {
    /// Version string stamped on every output.
    fn version(&self) -> String {
        "local".to_string()
    }

    /// Predict one label per row of `features`.
    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<Label>>;

    /// Whether `predict_proba` is available.
    fn supports_probabilities(&self) -> bool {
        false
    }

    /// One probability vector per row of `features`.
    fn predict_proba(&self, _features: &FeatureMatrix) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("model does not support probability estimation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_is_row_major_f32() {
        let matrix = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.5]]).unwrap();
        assert_eq!(matrix.rows(), 2);
        assert_eq!(matrix.cols(), 2);
        assert_eq!(matrix.as_slice(), &[1.0f32, 2.0, 3.0, 4.5]);
        assert_eq!(matrix.row(1), &[3.0f32, 4.5]);
        assert_eq!(matrix.iter_rows().count(), 2);
    }

    #[test]
    fn test_matrix_rejects_ragged_rows() {
        let err = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidBatch(msg) if msg.contains("row 1")));
    }

    #[test]
    fn test_matrix_rejects_empty_input() {
        assert!(FeatureMatrix::from_rows(&[]).is_err());
        assert!(FeatureMatrix::from_rows(&[vec![]]).is_err());
    }

    #[test]
    fn test_label_class_index() {
        assert_eq!(Label::Class(2).class_index(), Some(2));
        assert_eq!(Label::Class(-1).class_index(), None);
        assert_eq!(Label::Value(1.0).class_index(), Some(1));
        assert_eq!(Label::Value(1.5).class_index(), None);
        assert_eq!(Label::Value(-3.0).class_index(), None);
    }

    #[test]
    fn test_label_serializes_untagged() {
        assert_eq!(serde_json::to_string(&Label::Class(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&Label::Value(0.25)).unwrap(), "0.25");
        assert_eq!(serde_json::from_str::<Label>("7").unwrap(), Label::Class(7));
    }
}
