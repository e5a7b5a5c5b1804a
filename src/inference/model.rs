use ndarray::{Array4, ArrayView4};
use thiserror::Error;

/// Errors raised by a segmentation network or by its output shape checks.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model backend failed: {0}")]
    Backend(String),
    #[error("Model {what} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: [usize; 4],
        actual: [usize; 4],
    },
}

/// Raw network output for a batch of windows, both in NHWC layout.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Per-class scores including the background channel.
    pub output: Array4<f32>,
    /// Per-pixel feature vectors used by the augment head.
    pub features: Array4<f32>,
}

impl ModelOutput {
    /// Check both arrays against the expected batch geometry.
    pub fn check_shape(
        &self,
        batch: usize,
        height: usize,
        width: usize,
        output_channels: usize,
        output_features: usize,
    ) -> Result<(), ModelError> {
        check_dims(
            "output",
            self.output.dim(),
            [batch, height, width, output_channels],
        )?;
        check_dims(
            "features",
            self.features.dim(),
            [batch, height, width, output_features],
        )
    }
}

fn check_dims(
    what: &'static str,
    actual: (usize, usize, usize, usize),
    expected: [usize; 4],
) -> Result<(), ModelError> {
    let actual = [actual.0, actual.1, actual.2, actual.3];
    if actual != expected {
        return Err(ModelError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// A trained segmentation network producing class scores and feature maps.
///
/// Inputs are NHWC batches with values in `[0, 1]`.
pub trait SegmentationModel {
    /// Output channels including the background channel.
    fn output_channels(&self) -> usize;

    /// Width of the per-pixel feature vector.
    fn output_features(&self) -> usize;

    /// Run the network once over a batch of windows.
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError>;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for Box<M> {
    fn output_channels(&self) -> usize {
        (**self).output_channels()
    }

    fn output_features(&self) -> usize {
        (**self).output_features()
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError> {
        (**self).predict(batch)
    }
}
