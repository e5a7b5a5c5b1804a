use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::{LOGREG_MODEL_VERSION, LogRegModel};
use crate::ml::softmax;

/// Training options for the logistic regression head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub batch_size: usize,
    pub seed: u64,
    pub balance_classes: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.1,
            l2: 1e-4,
            batch_size: 128,
            seed: 42,
            balance_classes: false,
        }
    }
}

/// In-memory training set: one feature row per labelled pixel.
#[derive(Debug, Clone)]
pub struct TrainDataset {
    pub num_classes: usize,
    pub x: Array2<f32>,
    pub y: Vec<usize>,
}

/// Fit a multinomial logistic regression head with mini-batch SGD.
pub fn train_logreg(dataset: &TrainDataset, options: &TrainOptions) -> Result<LogRegModel, String> {
    let rows = dataset.x.nrows();
    let dim = dataset.x.ncols();
    if rows == 0 || dataset.y.is_empty() {
        return Err("Empty training set".to_string());
    }
    if rows != dataset.y.len() {
        return Err("Mismatched training inputs/labels".to_string());
    }
    if dim == 0 {
        return Err("Training rows have no features".to_string());
    }
    let classes = dataset.num_classes;
    if classes == 0 {
        return Err("No classes available for training".to_string());
    }
    if let Some(&bad) = dataset.y.iter().find(|&&y| y >= classes) {
        return Err(format!("Label {bad} out of range for {classes} classes"));
    }

    let (feature_mean, feature_scale) = standardization(&dataset.x);
    let mut x = dataset.x.clone();
    for mut row in x.axis_iter_mut(Axis(0)) {
        for (i, value) in row.iter_mut().enumerate() {
            *value = (*value - feature_mean[i]) * feature_scale[i];
        }
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut weights = vec![0.0f32; classes * dim];
    let mut bias = vec![0.0f32; classes];
    for w in &mut weights {
        *w = (rng.random::<f32>() - 0.5) * 0.01;
    }

    let class_weights = class_weights(&dataset.y, classes, options.balance_classes);
    let mut indices: Vec<usize> = (0..rows).collect();
    let batch_size = options.batch_size.max(1);
    let lr = options.learning_rate;
    let l2 = options.l2.max(0.0);

    let mut grad_w = vec![0.0f32; weights.len()];
    let mut grad_b = vec![0.0f32; classes];
    let mut logits = vec![0.0f32; classes];
    for _epoch in 0..options.epochs {
        indices.shuffle(&mut rng);
        for chunk in indices.chunks(batch_size) {
            grad_w.iter_mut().for_each(|g| *g = 0.0);
            grad_b.iter_mut().for_each(|g| *g = 0.0);
            let mut batch_weight = 0.0f32;
            for &idx in chunk {
                let row = x.row(idx);
                let y = dataset.y[idx];
                let weight = class_weights[y];
                if weight == 0.0 {
                    continue;
                }
                for (c, logit) in logits.iter_mut().enumerate() {
                    let base = c * dim;
                    let mut sum = bias[c];
                    for (i, &value) in row.iter().enumerate() {
                        sum += weights[base + i] * value;
                    }
                    *logit = sum;
                }
                let probs = softmax(&logits);
                for c in 0..classes {
                    let diff = (probs[c] - if c == y { 1.0 } else { 0.0 }) * weight;
                    let base = c * dim;
                    for (i, &value) in row.iter().enumerate() {
                        grad_w[base + i] += diff * value;
                    }
                    grad_b[c] += diff;
                }
                batch_weight += weight;
            }
            if batch_weight == 0.0 {
                continue;
            }
            let inv = 1.0 / batch_weight;
            for (w, g) in weights.iter_mut().zip(grad_w.iter()) {
                *w -= lr * (g * inv + l2 * *w);
            }
            for (b, g) in bias.iter_mut().zip(grad_b.iter()) {
                *b -= lr * g * inv;
            }
        }
    }

    let model = LogRegModel {
        model_version: LOGREG_MODEL_VERSION,
        feature_dim: dim,
        num_classes: classes,
        weights,
        bias,
        feature_mean,
        feature_scale,
        temperature: 1.0,
    };
    model.validate()?;
    Ok(model)
}

fn standardization(x: &Array2<f32>) -> (Vec<f32>, Vec<f32>) {
    let mean = x
        .mean_axis(Axis(0))
        .map(|m| m.to_vec())
        .unwrap_or_else(|| vec![0.0; x.ncols()]);
    let scale = x
        .axis_iter(Axis(1))
        .zip(mean.iter())
        .map(|(column, &m)| {
            let var = column.iter().map(|&v| (v - m) * (v - m)).sum::<f32>()
                / column.len().max(1) as f32;
            let std = var.sqrt();
            if std > 1e-6 { 1.0 / std } else { 1.0 }
        })
        .collect();
    (mean, scale)
}

fn class_weights(labels: &[usize], classes: usize, balance: bool) -> Vec<f32> {
    if !balance {
        return vec![1.0; classes];
    }
    let mut counts = vec![0f32; classes];
    for &y in labels {
        counts[y] += 1.0;
    }
    let total: f32 = counts.iter().sum();
    counts
        .into_iter()
        .map(|count| {
            if count == 0.0 {
                0.0
            } else {
                total / (classes as f32 * count)
            }
        })
        .collect()
}
