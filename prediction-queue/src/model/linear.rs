//! Multinomial logistic model loaded from a JSON file.

use std::path::Path;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use super::{FeatureMatrix, Label, PredictionModel};

/// Linear classifier: one weight row and bias per class, softmax probabilities.
///
/// The on-disk format is plain JSON:
///
/// ```json
/// { "version": "3", "weights": [[0.5, -1.0], [-0.5, 1.0]], "bias": [0.0, 0.1] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub version: String,
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearModel {
    pub fn new(
        version: impl Into<String>,
        weights: Vec<Vec<f32>>,
        bias: Vec<f32>,
    ) -> anyhow::Result<Self> {
        let model = Self {
            version: version.into(),
            weights,
            bias,
        };
        model.validate()?;
        Ok(model)
    }

    /// Load and validate a model file.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model file {}", path.display()))?;
        let model: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse model file {}", path.display()))?;
        model.validate()?;

        tracing::info!(
            version = %model.version,
            classes = model.classes(),
            features = model.features(),
            "Loaded linear model"
        );
        Ok(model)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.weights.is_empty(), "model has no classes");
        let features = self.weights[0].len();
        ensure!(features > 0, "model has no features");
        ensure!(
            self.weights.iter().all(|row| row.len() == features),
            "every class must have {features} weights"
        );
        ensure!(
            self.bias.len() == self.weights.len(),
            "expected {} bias terms, got {}",
            self.weights.len(),
            self.bias.len()
        );
        Ok(())
    }

    pub fn classes(&self) -> usize {
        self.weights.len()
    }

    pub fn features(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn check_shape(&self, features: &FeatureMatrix) -> anyhow::Result<()> {
        ensure!(
            features.cols() == self.features(),
            "model expects {} features, got {}",
            self.features(),
            features.cols()
        );
        Ok(())
    }

    fn scores(&self, row: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(weights, bias)| {
                weights.iter().zip(row).map(|(w, x)| w * x).sum::<f32>() + bias
            })
            .collect()
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        })
        .0
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

impl PredictionModel for LinearModel {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn predict(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<Label>> {
        self.check_shape(features)?;
        Ok(features
            .iter_rows()
            .map(|row| Label::Class(argmax(&self.scores(row)) as i64))
            .collect())
    }

    fn supports_probabilities(&self) -> bool {
        true
    }

    fn predict_proba(&self, features: &FeatureMatrix) -> anyhow::Result<Vec<Vec<f32>>> {
        self.check_shape(features)?;
        Ok(features
            .iter_rows()
            .map(|row| softmax(&self.scores(row)))
            .collect())
    }
}
