//! The auxiliary classifier refitted on user samples.

use ndarray::{Array2, ArrayView2, Axis};

use crate::ml::logreg::{LogRegModel, TrainDataset, TrainOptions, train_logreg};
use crate::ml::metrics::{ConfusionMatrix, accuracy};
use crate::ml::argmax;

/// A classifier that can be refit on per-pixel feature rows.
///
/// Sessions clone a fresh instance from an injected prototype on reset, so
/// implementations must be cheap to clone in their untrained state.
pub trait AugmentClassifier: Clone {
    fn num_classes(&self) -> usize;

    /// Fit from scratch on `x` (rows of features) and `y` (class indices).
    fn fit(&mut self, x: ArrayView2<'_, f32>, y: &[usize]) -> Result<(), String>;

    /// Class probabilities per row, shape `(rows, num_classes)`.
    fn predict_proba(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, String>;

    /// Fraction of rows whose most probable class matches `y`.
    fn score(&self, x: ArrayView2<'_, f32>, y: &[usize]) -> Result<f32, String> {
        let proba = self.predict_proba(x)?;
        let predicted: Vec<usize> = proba
            .axis_iter(Axis(0))
            .map(|row| argmax(&row.to_vec()))
            .collect();
        let cm = ConfusionMatrix::from_labels(self.num_classes(), y, &predicted);
        Ok(accuracy(&cm))
    }
}

/// Logistic regression head used as the default augment classifier.
#[derive(Debug, Clone)]
pub struct LogRegAugment {
    num_classes: usize,
    options: TrainOptions,
    model: Option<LogRegModel>,
}

impl LogRegAugment {
    pub fn new(num_classes: usize, options: TrainOptions) -> Self {
        Self {
            num_classes,
            options,
            model: None,
        }
    }

    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    pub fn model(&self) -> Option<&LogRegModel> {
        self.model.as_ref()
    }
}

impl AugmentClassifier for LogRegAugment {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn fit(&mut self, x: ArrayView2<'_, f32>, y: &[usize]) -> Result<(), String> {
        let dataset = TrainDataset {
            num_classes: self.num_classes,
            x: x.to_owned(),
            y: y.to_vec(),
        };
        self.model = Some(train_logreg(&dataset, &self.options)?);
        Ok(())
    }

    fn predict_proba(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, String> {
        self.model
            .as_ref()
            .ok_or_else(|| "Augment classifier has not been fit".to_string())?
            .predict_proba_rows(x)
    }
}

/// Classifier plus whether its predictions replace the network output.
#[derive(Debug, Clone)]
pub struct AugmentState<C> {
    pub classifier: C,
    pub active: bool,
}

impl<C: AugmentClassifier> AugmentState<C> {
    /// An untrained, inactive copy of `prototype`.
    pub fn fresh(prototype: &C) -> Self {
        Self {
            classifier: prototype.clone(),
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn unfit_classifier_refuses_to_predict() {
        let classifier = LogRegAugment::new(2, TrainOptions::default());
        let x = array![[0.0f32, 1.0]];
        assert!(classifier.predict_proba(x.view()).is_err());
        assert!(classifier.model().is_none());
    }

    #[test]
    fn fit_then_score_separable_rows() {
        let mut classifier = LogRegAugment::new(
            2,
            TrainOptions {
                epochs: 50,
                batch_size: 4,
                ..TrainOptions::default()
            },
        );
        let x = array![[0.0f32, 0.0], [0.1, 0.0], [1.0, 1.0], [0.9, 1.0]];
        let y = [0, 0, 1, 1];
        classifier.fit(x.view(), &y).unwrap();
        assert_eq!(classifier.score(x.view(), &y).unwrap(), 1.0);
        assert_eq!(classifier.predict_proba(x.view()).unwrap().dim(), (4, 2));
    }

    #[test]
    fn fresh_state_is_inactive_and_unfit() {
        let prototype = LogRegAugment::new(4, TrainOptions::default());
        let state = AugmentState::fresh(&prototype);
        assert!(!state.active);
        assert!(state.classifier.model().is_none());
    }
}
