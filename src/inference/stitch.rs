//! Overlapping-window inference over full tiles.
//!
//! A tile is covered by square windows laid out on a stride grid plus one
//! window flush with the far edge of each axis. Window predictions are
//! weighted by a fixed blend kernel that favours the window centre, summed,
//! and normalised by the accumulated weight so seams do not show.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use thiserror::Error;
use tracing::debug;

use super::model::{ModelError, SegmentationModel};
use crate::config::InferenceSettings;

/// Initial weight count; keeps the normalising division finite.
const COUNT_EPSILON: f32 = 1e-9;
const BORDER_WEIGHT: f32 = 0.1;
const INTERIOR_WEIGHT: f32 = 1.0;
const CENTER_WEIGHT: f32 = 5.0;
/// Width of the low-weight frame around every window.
const BORDER_MARGIN: usize = 10;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("Tile is empty ({height}x{width}x{channels})")]
    EmptyTile {
        height: usize,
        width: usize,
        channels: usize,
    },
    #[error("Invalid inference settings: {0}")]
    InvalidSettings(String),
    #[error("Failed to assemble window batch: {0}")]
    Batch(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Blended full-resolution prediction for one tile.
#[derive(Debug, Clone)]
pub struct TilePrediction {
    /// Class scores with the background channel removed, `(H, W, output_channels - 1)`.
    pub output: Array3<f32>,
    /// Blended feature map, `(H, W, output_features)`.
    pub features: Array3<f32>,
}

/// Window origins along one axis: stride steps plus one origin flush with the far edge.
///
/// Extents no larger than the window yield a single origin at 0.
pub fn window_origins(extent: usize, input_size: usize, stride: usize) -> Vec<usize> {
    if extent <= input_size {
        return vec![0];
    }
    let last = extent - input_size;
    let mut origins: Vec<usize> = (0..last).step_by(stride.max(1)).collect();
    origins.push(last);
    origins
}

/// Build the per-window blend weights.
pub fn blend_kernel(
    input_size: usize,
    stride_y: usize,
    stride_x: usize,
    down_weight_padding: usize,
) -> Array2<f32> {
    let mut kernel = Array2::from_elem((input_size, input_size), BORDER_WEIGHT);
    if input_size > 2 * BORDER_MARGIN {
        kernel
            .slice_mut(s![
                BORDER_MARGIN..input_size - BORDER_MARGIN,
                BORDER_MARGIN..input_size - BORDER_MARGIN
            ])
            .fill(INTERIOR_WEIGHT);
    }
    let start = down_weight_padding.min(input_size);
    let end_y = (down_weight_padding + stride_y).min(input_size);
    let end_x = (down_weight_padding + stride_x).min(input_size);
    kernel
        .slice_mut(s![start..end_y, start..end_x])
        .fill(CENTER_WEIGHT);
    kernel
}

/// Weighted sums of window predictions for one stitching pass.
#[derive(Debug)]
pub struct PredictionAccumulator {
    output: Array3<f32>,
    features: Array3<f32>,
    counts: Array2<f32>,
}

impl PredictionAccumulator {
    pub fn new(height: usize, width: usize, output_channels: usize, output_features: usize) -> Self {
        Self {
            output: Array3::zeros((height, width, output_channels)),
            features: Array3::zeros((height, width, output_features)),
            counts: Array2::from_elem((height, width), COUNT_EPSILON),
        }
    }

    /// Add one window's output and features at origin `(y, x)`.
    pub fn add_window(
        &mut self,
        y: usize,
        x: usize,
        output: ArrayView3<'_, f32>,
        features: ArrayView3<'_, f32>,
        kernel: ArrayView2<'_, f32>,
    ) {
        let (kh, kw) = kernel.dim();
        let weights = kernel.insert_axis(Axis(2));
        let mut region = self.output.slice_mut(s![y..y + kh, x..x + kw, ..]);
        region += &(&output * &weights);
        let mut region = self.features.slice_mut(s![y..y + kh, x..x + kw, ..]);
        region += &(&features * &weights);
        let mut counts = self.counts.slice_mut(s![y..y + kh, x..x + kw]);
        counts += &kernel;
    }

    /// Accumulated blend weight per pixel.
    pub fn counts(&self) -> ArrayView2<'_, f32> {
        self.counts.view()
    }

    /// Normalise by the accumulated weights and drop the background channel.
    pub fn finish(self) -> TilePrediction {
        let counts = self.counts.insert_axis(Axis(2));
        let output = &self.output / &counts;
        let features = &self.features / &counts;
        TilePrediction {
            output: output.slice(s![.., .., 1..]).to_owned(),
            features,
        }
    }
}

/// Sliding-window tile inference with overlap blending.
#[derive(Debug, Clone)]
pub struct TileStitcher {
    input_size: usize,
    stride_y: usize,
    stride_x: usize,
    batch_size: usize,
    kernel: Array2<f32>,
}

impl TileStitcher {
    pub fn new(settings: &InferenceSettings) -> Result<Self, StitchError> {
        settings.validate().map_err(StitchError::InvalidSettings)?;
        Ok(Self {
            input_size: settings.input_size,
            stride_y: settings.stride_y,
            stride_x: settings.stride_x,
            batch_size: settings.batch_size.max(1),
            kernel: blend_kernel(
                settings.input_size,
                settings.stride_y,
                settings.stride_x,
                settings.down_weight_padding,
            ),
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn kernel(&self) -> ArrayView2<'_, f32> {
        self.kernel.view()
    }

    /// Predict a whole tile, returning blended scores and features.
    ///
    /// Axes shorter than the window are zero-padded for inference and the
    /// result is cropped back to the tile extent.
    pub fn run<M: SegmentationModel + ?Sized>(
        &self,
        model: &M,
        tile: ArrayView3<'_, f32>,
    ) -> Result<TilePrediction, StitchError> {
        let (height, width, _) = tile.dim();
        let prediction = self.accumulate(model, tile)?.finish();
        if prediction.output.dim().0 == height && prediction.output.dim().1 == width {
            return Ok(prediction);
        }
        Ok(TilePrediction {
            output: prediction.output.slice(s![..height, ..width, ..]).to_owned(),
            features: prediction.features.slice(s![..height, ..width, ..]).to_owned(),
        })
    }

    /// Run every window through the model and return the raw weighted sums.
    ///
    /// The accumulator covers the padded extent when the tile is smaller than
    /// the window.
    pub fn accumulate<M: SegmentationModel + ?Sized>(
        &self,
        model: &M,
        tile: ArrayView3<'_, f32>,
    ) -> Result<PredictionAccumulator, StitchError> {
        let (height, width, channels) = tile.dim();
        if height == 0 || width == 0 || channels == 0 {
            return Err(StitchError::EmptyTile {
                height,
                width,
                channels,
            });
        }
        let size = self.input_size;
        let padded = (height < size || width < size).then(|| {
            let mut padded = Array3::<f32>::zeros((height.max(size), width.max(size), channels));
            padded.slice_mut(s![..height, ..width, ..]).assign(&tile);
            padded
        });
        let source = match padded.as_ref() {
            Some(padded) => padded.view(),
            None => tile.view(),
        };
        let (src_height, src_width, _) = source.dim();

        let origins: Vec<(usize, usize)> = window_origins(src_height, size, self.stride_y)
            .into_iter()
            .flat_map(|y| {
                window_origins(src_width, size, self.stride_x)
                    .into_iter()
                    .map(move |x| (y, x))
            })
            .collect();
        debug!(
            "Stitching {}x{} tile with {} windows in batches of {}",
            height,
            width,
            origins.len(),
            self.batch_size
        );

        let output_channels = model.output_channels();
        let output_features = model.output_features();
        let mut acc =
            PredictionAccumulator::new(src_height, src_width, output_channels, output_features);
        for chunk in origins.chunks(self.batch_size) {
            let windows: Vec<ArrayView3<'_, f32>> = chunk
                .iter()
                .map(|&(y, x)| source.slice(s![y..y + size, x..x + size, ..]))
                .collect();
            let batch = ndarray::stack(Axis(0), &windows)?;
            let predicted = model.predict(batch.view())?;
            predicted.check_shape(chunk.len(), size, size, output_channels, output_features)?;
            for (i, &(y, x)) in chunk.iter().enumerate() {
                acc.add_window(
                    y,
                    x,
                    predicted.output.index_axis(Axis(0), i),
                    predicted.features.index_axis(Axis(0), i),
                    self.kernel.view(),
                );
            }
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::model::ModelOutput;
    use ndarray::{Array4, ArrayView4};
    use std::cell::Cell;

    struct ConstantModel {
        scores: Vec<f32>,
        features: usize,
        calls: Cell<usize>,
    }

    impl ConstantModel {
        fn new(scores: Vec<f32>, features: usize) -> Self {
            Self {
                scores,
                features,
                calls: Cell::new(0),
            }
        }
    }

    impl SegmentationModel for ConstantModel {
        fn output_channels(&self) -> usize {
            self.scores.len()
        }

        fn output_features(&self) -> usize {
            self.features
        }

        fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError> {
            self.calls.set(self.calls.get() + 1);
            let (n, h, w, _) = batch.dim();
            let output = Array4::from_shape_fn((n, h, w, self.scores.len()), |(_, _, _, c)| {
                self.scores[c]
            });
            let features = Array4::from_shape_fn((n, h, w, self.features), |(_, _, _, f)| {
                f as f32 * 0.5
            });
            Ok(ModelOutput { output, features })
        }
    }

    fn small_settings() -> InferenceSettings {
        InferenceSettings {
            input_size: 32,
            stride_y: 16,
            stride_x: 16,
            down_weight_padding: 8,
            batch_size: 8,
            output_channels: 3,
            output_features: 2,
        }
    }

    #[test]
    fn origins_end_flush_with_far_edge() {
        assert_eq!(window_origins(480, 240, 160), vec![0, 160, 240]);
        assert_eq!(window_origins(500, 240, 130), vec![0, 130, 260]);
        assert_eq!(window_origins(400, 240, 160), vec![0, 160]);
        assert_eq!(window_origins(240, 240, 160), vec![0]);
        assert_eq!(window_origins(100, 240, 160), vec![0]);
    }

    #[test]
    fn kernel_weights_border_interior_and_center() {
        let kernel = blend_kernel(240, 160, 160, 40);
        assert_eq!(kernel[[0, 0]], 0.1);
        assert_eq!(kernel[[9, 120]], 0.1);
        assert_eq!(kernel[[15, 15]], 1.0);
        assert_eq!(kernel[[40, 40]], 5.0);
        assert_eq!(kernel[[199, 199]], 5.0);
        assert_eq!(kernel[[200, 200]], 1.0);
        assert_eq!(kernel[[235, 235]], 0.1);
    }

    #[test]
    fn every_pixel_is_covered() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.0, 1.0, 2.0], 2);
        let tile = Array3::<f32>::zeros((70, 53, 4));
        let acc = stitcher.accumulate(&model, tile.view()).unwrap();
        assert!(acc.counts().iter().all(|&count| count >= BORDER_WEIGHT));
    }

    #[test]
    fn constant_model_output_survives_blending() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.3, 0.7, 0.25], 2);
        let tile = Array3::<f32>::from_elem((75, 64, 4), 0.5);
        let prediction = stitcher.run(&model, tile.view()).unwrap();
        assert_eq!(prediction.output.dim(), (75, 64, 2));
        assert_eq!(prediction.features.dim(), (75, 64, 2));
        for pixel in prediction.output.lanes(Axis(2)) {
            assert!((pixel[0] - 0.7).abs() < 1e-4);
            assert!((pixel[1] - 0.25).abs() < 1e-4);
        }
        for pixel in prediction.features.lanes(Axis(2)) {
            assert!(pixel[0].abs() < 1e-4);
            assert!((pixel[1] - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn windows_are_batched() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.0, 1.0, 0.0], 2);
        let tile = Array3::<f32>::zeros((96, 96, 3));
        stitcher.run(&model, tile.view()).unwrap();
        // 5 origins per axis, 25 windows, batches of 8.
        assert_eq!(model.calls.get(), 4);
    }

    #[test]
    fn small_tiles_are_padded_and_cropped() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.0, 0.4, 0.6], 2);
        let tile = Array3::<f32>::from_elem((20, 50, 4), 0.2);
        let prediction = stitcher.run(&model, tile.view()).unwrap();
        assert_eq!(prediction.output.dim(), (20, 50, 2));
        assert!(
            prediction
                .output
                .lanes(Axis(2))
                .into_iter()
                .all(|pixel| (pixel[0] - 0.4).abs() < 1e-4)
        );
    }

    #[test]
    fn accumulator_extent_follows_padding() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.0, 1.0], 2);
        let small = Array3::<f32>::zeros((20, 50, 4));
        let acc = stitcher.accumulate(&model, small.view()).unwrap();
        assert_eq!(acc.counts().dim(), (32, 50));
        let large = Array3::<f32>::zeros((40, 40, 4));
        let acc = stitcher.accumulate(&model, large.view()).unwrap();
        assert_eq!(acc.counts().dim(), (40, 40));
    }

    #[test]
    fn empty_tiles_are_rejected() {
        let stitcher = TileStitcher::new(&small_settings()).unwrap();
        let model = ConstantModel::new(vec![0.0, 1.0], 2);
        let tile = Array3::<f32>::zeros((0, 40, 4));
        let err = stitcher.run(&model, tile.view()).unwrap_err();
        assert!(matches!(err, StitchError::EmptyTile { .. }));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = small_settings();
        settings.stride_x = 0;
        assert!(matches!(
            TileStitcher::new(&settings),
            Err(StitchError::InvalidSettings(_))
        ));
    }
}
