//! Multinomial logistic regression over per-pixel feature vectors.

use std::path::Path;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::ml::softmax;

mod train;
pub use train::{TrainDataset, TrainOptions, train_logreg};

/// Current serialized model format.
pub const LOGREG_MODEL_VERSION: i64 = 1;

/// File name of the exported augment head inside the models directory.
pub const AUGMENT_MODEL_FILE: &str = "augment_logreg.json";

/// Versioned logistic regression model with its own feature standardization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRegModel {
    pub model_version: i64,
    pub feature_dim: usize,
    pub num_classes: usize,
    /// Row-major `[class][feature]` weights.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub feature_mean: Vec<f32>,
    /// Multiplicative inverse of the per-feature standard deviation.
    pub feature_scale: Vec<f32>,
    pub temperature: f32,
}

impl LogRegModel {
    /// Validate the model dimensions.
    pub fn validate(&self) -> Result<(), String> {
        if self.model_version != LOGREG_MODEL_VERSION {
            return Err(format!(
                "Unsupported model_version {} (expected {})",
                self.model_version, LOGREG_MODEL_VERSION
            ));
        }
        if self.num_classes == 0 {
            return Err("No classes defined".to_string());
        }
        if self.feature_dim == 0 {
            return Err("feature_dim must be > 0".to_string());
        }
        if self.weights.len() != self.num_classes * self.feature_dim {
            return Err("weights length mismatch".to_string());
        }
        if self.bias.len() != self.num_classes {
            return Err("bias length mismatch".to_string());
        }
        if self.feature_mean.len() != self.feature_dim
            || self.feature_scale.len() != self.feature_dim
        {
            return Err("standardization length mismatch".to_string());
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err("temperature must be > 0".to_string());
        }
        Ok(())
    }

    /// Load a model from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path).map_err(|err| err.to_string())?;
        let model: Self = serde_json::from_slice(&bytes).map_err(|err| err.to_string())?;
        model.validate()?;
        Ok(model)
    }

    /// Write the model as pretty JSON, creating parent directories.
    pub fn save_json(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|err| err.to_string())?;
        std::fs::write(path, bytes).map_err(|err| err.to_string())
    }

    fn logits(&self, features: ArrayView1<'_, f32>) -> Vec<f32> {
        let temp = self.temperature.max(1e-6);
        (0..self.num_classes)
            .map(|c| {
                let base = c * self.feature_dim;
                let mut sum = self.bias[c];
                for (i, &value) in features.iter().enumerate() {
                    let standardized = (value - self.feature_mean[i]) * self.feature_scale[i];
                    sum += self.weights[base + i] * standardized;
                }
                sum / temp
            })
            .collect()
    }

    /// Compute class probabilities for a single feature vector.
    ///
    /// Returns an empty vector when the feature length does not match.
    pub fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        if features.len() != self.feature_dim {
            return Vec::new();
        }
        softmax(&self.logits(ArrayView1::from(features)))
    }

    /// Compute class probabilities for every row of `x`, shape `(rows, num_classes)`.
    pub fn predict_proba_rows(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, String> {
        if x.ncols() != self.feature_dim {
            return Err(format!(
                "Feature width {} does not match model feature_dim {}",
                x.ncols(),
                self.feature_dim
            ));
        }
        let mut out = Array2::<f32>::zeros((x.nrows(), self.num_classes));
        for (row, mut target) in x.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            let proba = softmax(&self.logits(row));
            for (slot, value) in target.iter_mut().zip(proba) {
                *slot = value;
            }
        }
        Ok(out)
    }
}
