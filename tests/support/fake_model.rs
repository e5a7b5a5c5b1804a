use std::sync::atomic::{AtomicUsize, Ordering};

use glacier_tool::config::{InferenceSettings, SessionSettings};
use glacier_tool::inference::{ModelError, ModelOutput, SegmentationModel};
use glacier_tool::ml::logreg::TrainOptions;
use glacier_tool::session::{DefaultSession, LogRegAugment, SampleBlock, Session};
use ndarray::{Array3, Array4, ArrayView4};

/// Position-independent stand-in for the segmentation network.
///
/// Features echo the input channels; score channel `c` is `(c + 1) * x0`
/// where `x0` is the first input channel, with channel 0 as background.
pub struct EchoModel {
    pub features: usize,
    pub calls: AtomicUsize,
}

impl EchoModel {
    pub fn new(features: usize) -> Self {
        Self {
            features,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for EchoModel {
    fn output_channels(&self) -> usize {
        5
    }

    fn output_features(&self) -> usize {
        self.features
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (n, h, w, c) = batch.dim();
        let output = Array4::from_shape_fn((n, h, w, 5), |(i, y, x, k)| {
            (k as f32 + 1.0) * batch[[i, y, x, 0]]
        });
        let features =
            Array4::from_shape_fn((n, h, w, self.features), |(i, y, x, f)| batch[[i, y, x, f % c]]);
        Ok(ModelOutput { output, features })
    }
}

pub fn small_inference() -> InferenceSettings {
    InferenceSettings {
        input_size: 32,
        stride_y: 16,
        stride_x: 16,
        down_weight_padding: 8,
        batch_size: 8,
        output_channels: 5,
        output_features: 3,
    }
}

/// Feature value painted into each quadrant; one class per quadrant.
pub const QUADRANT_FEATURES: [[f32; 3]; 4] = [
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [1.0, 1.0, 1.0],
];

/// A `size x size x 3` tile split into four constant quadrants.
pub fn quadrant_tile(size: usize) -> Array3<f32> {
    let half = size / 2;
    Array3::from_shape_fn((size, size, 3), |(y, x, c)| {
        let quadrant = usize::from(y >= half) * 2 + usize::from(x >= half);
        QUADRANT_FEATURES[quadrant][c]
    })
}

pub fn new_session(seed: Vec<SampleBlock>, settings: SessionSettings) -> DefaultSession<EchoModel> {
    Session::new(
        EchoModel::new(3),
        LogRegAugment::new(
            4,
            TrainOptions {
                epochs: 30,
                batch_size: 32,
                ..TrainOptions::default()
            },
        ),
        seed,
        &small_inference(),
        settings,
    )
    .expect("session")
}
