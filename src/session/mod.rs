//! Per-user interactive state: the base network, the labelled samples and the
//! augment classifier refitted on them.
//!
//! A [`Session`] is mutated through `&mut self`; callers that share one across
//! request handlers wrap it in a `Mutex`.

pub mod augment;
pub mod samples;
pub mod undo;

use std::collections::BTreeSet;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, s};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{InferenceSettings, SessionSettings, ToolConfig};
use crate::inference::{ModelError, SegmentationModel, StitchError, TileStitcher};

pub use augment::{AugmentClassifier, AugmentState, LogRegAugment};
pub use samples::{SampleBlock, SampleError, SampleRect, SampleStore, load_seed_blocks};
pub use undo::{UndoEntry, UndoKind, UndoLog};

const RETRAIN_SUCCESS_PREFIX: &str = "Fit accessory model with";
const RETRAIN_MISSING_CLASSES: &str = "Need to include training samples from each class";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Stitch(#[from] StitchError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("No feature map available; run inference on a tile first")]
    NoFeatureMap,
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error("Class index {class_index} is out of range for {num_classes} classes")]
    ClassOutOfRange {
        class_index: usize,
        num_classes: usize,
    },
    #[error("Augment classifier failed: {0}")]
    Classifier(String),
    #[error("Invalid seed samples: {0}")]
    InvalidSeed(String),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("Batch windows must be non-empty, got {height}x{width}")]
    EmptyWindow { height: usize, width: usize },
}

/// Result of a retrain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainOutcome {
    pub success: bool,
    pub message: String,
    pub sample_count: usize,
}

/// Result of an undo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoOutcome {
    pub success: bool,
    pub message: String,
    pub num_undone: usize,
}

/// Batch predictions, either per pixel or for the window centre only.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPrediction {
    /// `(n, h, w, classes)`
    Dense(Array4<f32>),
    /// `(n, classes)`
    Central(Array2<f32>),
}

/// Session with the default logistic regression augment head.
pub type DefaultSession<M> = Session<M, LogRegAugment>;

pub struct Session<M, C> {
    model: M,
    stitcher: TileStitcher,
    batch_size: usize,
    settings: SessionSettings,
    prototype: C,
    augment: AugmentState<C>,
    store: SampleStore,
    undo: UndoLog<C>,
    current_features: Option<Array3<f32>>,
}

impl<M: SegmentationModel, C: AugmentClassifier> Session<M, C> {
    /// Build a session and bring it to its reset state.
    ///
    /// `seed` blocks are kept for the lifetime of the session and restored on
    /// every [`Session::reset`].
    pub fn new(
        model: M,
        prototype: C,
        seed: Vec<SampleBlock>,
        inference: &InferenceSettings,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        if prototype.num_classes() != settings.num_classes {
            return Err(SessionError::InvalidConfig(format!(
                "augment classifier predicts {} classes, session expects {}",
                prototype.num_classes(),
                settings.num_classes
            )));
        }
        if model.output_channels() != inference.output_channels
            || model.output_features() != inference.output_features
        {
            return Err(SessionError::InvalidConfig(format!(
                "model produces {} channels and {} features, settings expect {} and {}",
                model.output_channels(),
                model.output_features(),
                inference.output_channels,
                inference.output_features
            )));
        }
        if inference.class_channels() != settings.num_classes {
            return Err(SessionError::InvalidConfig(format!(
                "{} class channels after background, session expects {} classes",
                inference.class_channels(),
                settings.num_classes
            )));
        }
        for block in &seed {
            if block.features.ncols() != model.output_features() {
                return Err(SessionError::InvalidSeed(format!(
                    "seed rows have {} features, model produces {}",
                    block.features.ncols(),
                    model.output_features()
                )));
            }
            if let Some(&label) = block.labels.iter().find(|&&l| l >= settings.num_classes) {
                return Err(SessionError::InvalidSeed(format!(
                    "seed label {label} is out of range for {} classes",
                    settings.num_classes
                )));
            }
        }
        let stitcher = TileStitcher::new(inference)?;
        let augment = AugmentState::fresh(&prototype);
        let mut session = Self {
            model,
            stitcher,
            batch_size: inference.batch_size.max(1),
            settings,
            prototype,
            augment,
            store: SampleStore::new(seed),
            undo: UndoLog::new(),
            current_features: None,
        };
        session.reset()?;
        Ok(session)
    }

    /// Predict a whole tile and keep its feature map for later sampling.
    ///
    /// Once the augment classifier is active its probabilities replace the
    /// network scores.
    pub fn run(&mut self, tile: ArrayView3<'_, f32>) -> Result<Array3<f32>, SessionError> {
        let (output, features) = self.run_model_on_tile(tile)?;
        let output = if self.augment.active {
            let (height, width, depth) = features.dim();
            let flat = features.to_shape((height * width, depth))?;
            let proba = self.reclassify(flat.view())?;
            proba.into_shape_with_order((height, width, self.settings.num_classes))?
        } else {
            output
        };
        self.current_features = Some(features);
        Ok(output)
    }

    /// Stitched network scores (background dropped) and features for a tile.
    pub fn run_model_on_tile(
        &self,
        tile: ArrayView3<'_, f32>,
    ) -> Result<(Array3<f32>, Array3<f32>), SessionError> {
        let prediction = self.stitcher.run(&self.model, tile)?;
        Ok((prediction.output, prediction.features))
    }

    /// Predict a stack of windows with values in `[0, 1]`.
    pub fn run_model_on_batch(
        &self,
        batch: ArrayView4<'_, f32>,
        predict_central_pixel_only: bool,
    ) -> Result<BatchPrediction, SessionError> {
        let (n, height, width, _) = batch.dim();
        let classes = self.settings.num_classes;
        if height == 0 || width == 0 {
            return Err(SessionError::EmptyWindow { height, width });
        }
        if n == 0 {
            return Ok(if predict_central_pixel_only {
                BatchPrediction::Central(Array2::zeros((0, classes)))
            } else {
                BatchPrediction::Dense(Array4::zeros((0, height, width, classes)))
            });
        }
        let (output, features) = self.predict_chunked(batch)?;
        let (cy, cx) = (height / 2, width / 2);

        if !self.augment.active {
            let output = output.slice(s![.., .., .., 1..]);
            return Ok(if predict_central_pixel_only {
                BatchPrediction::Central(output.slice(s![.., cy, cx, ..]).to_owned())
            } else {
                BatchPrediction::Dense(output.to_owned())
            });
        }

        if predict_central_pixel_only {
            let central = features.slice(s![.., cy, cx, ..]);
            return Ok(BatchPrediction::Central(self.reclassify(central)?));
        }
        let depth = features.dim().3;
        let flat = features.to_shape((n * height * width, depth))?;
        let proba = self.reclassify(flat.view())?;
        Ok(BatchPrediction::Dense(
            proba.into_shape_with_order((n, height, width, classes))?,
        ))
    }

    /// Label every feature vector inside `rect` of the current feature map.
    pub fn add_sample(&mut self, rect: SampleRect, class_index: usize) -> Result<(), SessionError> {
        if class_index >= self.settings.num_classes {
            return Err(SessionError::ClassOutOfRange {
                class_index,
                num_classes: self.settings.num_classes,
            });
        }
        let features = self
            .current_features
            .as_ref()
            .ok_or(SessionError::NoFeatureMap)?;
        let block = SampleBlock::from_region(features.view(), rect, class_index)?;
        debug!(
            "Adding {} samples of class {} from {:?}",
            block.len(),
            class_index,
            rect
        );
        self.store.push(block);
        self.undo.push(UndoEntry::Sample);
        Ok(())
    }

    /// Refit the augment classifier on every stored sample.
    pub fn retrain(&mut self) -> Result<RetrainOutcome, SessionError> {
        let Some((x, y)) = self.store.concatenate() else {
            return Ok(RetrainOutcome {
                success: false,
                message: RETRAIN_MISSING_CLASSES.to_string(),
                sample_count: 0,
            });
        };
        let distinct = y.iter().copied().collect::<BTreeSet<_>>().len();
        if distinct < self.settings.min_retrain_classes {
            debug!(
                "Retrain skipped: {} of {} classes labelled",
                distinct, self.settings.min_retrain_classes
            );
            return Ok(RetrainOutcome {
                success: false,
                message: RETRAIN_MISSING_CLASSES.to_string(),
                sample_count: y.len(),
            });
        }

        let mut classifier = self.augment.classifier.clone();
        classifier
            .fit(x.view(), &y)
            .map_err(SessionError::Classifier)?;
        let accuracy = classifier
            .score(x.view(), &y)
            .map_err(SessionError::Classifier)?;
        info!("fine-tuning accuracy: {:.4}", accuracy);

        let previous = std::mem::replace(
            &mut self.augment,
            AugmentState {
                classifier,
                active: true,
            },
        );
        self.undo.push(UndoEntry::Retrain { previous });
        let message = format!("{RETRAIN_SUCCESS_PREFIX} {} samples", y.len());
        info!("{message}");
        Ok(RetrainOutcome {
            success: true,
            message,
            sample_count: y.len(),
        })
    }

    /// Reverse the most recent action.
    ///
    /// A run of retrains is undone as one step together with the sample that
    /// preceded it, and the classifier reverts to its state before the run.
    pub fn undo(&mut self) -> UndoOutcome {
        match self.undo.pop() {
            None => UndoOutcome {
                success: false,
                message: "Nothing to undo".to_string(),
                num_undone: 0,
            },
            Some(UndoEntry::Sample) => {
                self.store.pop();
                debug!("Undoing sample");
                UndoOutcome {
                    success: true,
                    message: "Undoing sample".to_string(),
                    num_undone: 1,
                }
            }
            Some(UndoEntry::Retrain { previous }) => {
                self.augment = self.undo.pop_retrain_run().unwrap_or(previous);
                let sample_undone = self.undo.pop_sample();
                if sample_undone {
                    self.store.pop();
                }
                let message = if sample_undone {
                    "Undoing sample"
                } else {
                    "Undoing retrain"
                };
                debug!("{message} (retrain run reverted)");
                UndoOutcome {
                    success: true,
                    message: message.to_string(),
                    num_undone: 1,
                }
            }
        }
    }

    /// Drop user samples and the fitted classifier, keeping the seed set.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.store.reset();
        self.undo.clear();
        self.augment = AugmentState::fresh(&self.prototype);
        if self.settings.use_seed_data && !self.store.blocks().is_empty() {
            let outcome = self.retrain()?;
            if !outcome.success {
                warn!("Seed data could not be used: {}", outcome.message);
            }
        }
        Ok(())
    }

    /// Replace the feature map used by [`Session::add_sample`].
    pub fn set_current_features(&mut self, features: Array3<f32>) -> Result<(), SessionError> {
        let depth = features.dim().2;
        if depth != self.model.output_features() {
            return Err(SessionError::InvalidConfig(format!(
                "feature map has {depth} features, model produces {}",
                self.model.output_features()
            )));
        }
        self.current_features = Some(features);
        Ok(())
    }

    pub fn current_features(&self) -> Option<ArrayView3<'_, f32>> {
        self.current_features.as_ref().map(|f| f.view())
    }

    pub fn samples(&self) -> &SampleStore {
        &self.store
    }

    pub fn undo_log(&self) -> &UndoLog<C> {
        &self.undo
    }

    pub fn augment(&self) -> &AugmentState<C> {
        &self.augment
    }

    pub fn is_augment_active(&self) -> bool {
        self.augment.active
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn predict_chunked(
        &self,
        batch: ArrayView4<'_, f32>,
    ) -> Result<(Array4<f32>, Array4<f32>), SessionError> {
        let mut outputs = Vec::new();
        let mut features = Vec::new();
        for chunk in batch.axis_chunks_iter(Axis(0), self.batch_size) {
            let (n, h, w, _) = chunk.dim();
            let predicted = self.model.predict(chunk)?;
            predicted.check_shape(
                n,
                h,
                w,
                self.model.output_channels(),
                self.model.output_features(),
            )?;
            outputs.push(predicted.output);
            features.push(predicted.features);
        }
        if outputs.len() == 1 {
            if let (Some(output), Some(feature)) = (outputs.pop(), features.pop()) {
                return Ok((output, feature));
            }
        }
        let output_views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        let feature_views: Vec<_> = features.iter().map(|f| f.view()).collect();
        Ok((
            ndarray::concatenate(Axis(0), &output_views)?,
            ndarray::concatenate(Axis(0), &feature_views)?,
        ))
    }

    fn reclassify(&self, features: ArrayView2<'_, f32>) -> Result<Array2<f32>, SessionError> {
        let proba = self
            .augment
            .classifier
            .predict_proba(features)
            .map_err(SessionError::Classifier)?;
        if proba.dim() != (features.nrows(), self.settings.num_classes) {
            return Err(SessionError::Classifier(format!(
                "classifier returned {:?} probabilities for {} rows",
                proba.dim(),
                features.nrows()
            )));
        }
        Ok(proba)
    }
}

impl<M: SegmentationModel> DefaultSession<M> {
    /// Build a session from the `[inference]`, `[session]` and `[augment]`
    /// sections of `config`.
    pub fn from_config(
        model: M,
        config: &ToolConfig,
        seed: Vec<SampleBlock>,
    ) -> Result<Self, SessionError> {
        let prototype = LogRegAugment::new(config.session.num_classes, config.augment.clone());
        Self::new(
            model,
            prototype,
            seed,
            &config.inference,
            config.session.clone(),
        )
    }
}
