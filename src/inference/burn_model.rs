use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array4, ArrayView4};

use super::model::{ModelError, ModelOutput, SegmentationModel};

/// A Burn network taking NCHW input and returning `(scores, features)` in NCHW.
pub trait SegmentationNetwork<B: Backend> {
    fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>);
}

/// Adapts a Burn network to the NHWC `ndarray` contract used by the stitcher.
pub struct BurnSegmentationModel<B: Backend, N> {
    network: N,
    device: B::Device,
    output_channels: usize,
    output_features: usize,
}

impl<B: Backend, N: SegmentationNetwork<B>> BurnSegmentationModel<B, N> {
    pub fn new(
        network: N,
        device: B::Device,
        output_channels: usize,
        output_features: usize,
    ) -> Self {
        Self {
            network,
            device,
            output_channels,
            output_features,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl<B: Backend, N: SegmentationNetwork<B>> SegmentationModel for BurnSegmentationModel<B, N> {
    fn output_channels(&self) -> usize {
        self.output_channels
    }

    fn output_features(&self) -> usize {
        self.output_features
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError> {
        let (n, h, w, c) = batch.dim();
        let flat: Vec<f32> = batch.iter().copied().collect();
        let data = TensorData::new(flat, [n, h, w, c]);
        let input = Tensor::<B, 4>::from_data(data, &self.device).permute([0, 3, 1, 2]);
        let (scores, features) = self.network.forward(input);
        let output = ModelOutput {
            output: nchw_to_nhwc(scores)?,
            features: nchw_to_nhwc(features)?,
        };
        output.check_shape(n, h, w, self.output_channels, self.output_features)?;
        Ok(output)
    }
}

fn nchw_to_nhwc<B: Backend>(tensor: Tensor<B, 4>) -> Result<Array4<f32>, ModelError> {
    let tensor = tensor.permute([0, 2, 3, 1]);
    let [n, h, w, c] = tensor.dims();
    let values = tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| ModelError::Backend(format!("Failed to read Burn output tensor: {err:?}")))?;
    Array4::from_shape_vec((n, h, w, c), values)
        .map_err(|err| ModelError::Backend(format!("Burn output has unexpected length: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    struct EchoNetwork;

    impl<B: Backend> SegmentationNetwork<B> for EchoNetwork {
        fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
            (input.clone(), input.mul_scalar(2.0))
        }
    }

    #[test]
    fn preserves_nhwc_layout_through_the_network() {
        let model = BurnSegmentationModel::<NdArray, _>::new(
            EchoNetwork,
            NdArrayDevice::default(),
            3,
            3,
        );
        let batch = Array4::from_shape_fn((2, 4, 5, 3), |(n, y, x, c)| {
            (n * 1000 + y * 100 + x * 10 + c) as f32 / 10_000.0
        });
        let out = model.predict(batch.view()).unwrap();
        assert_eq!(out.output, batch);
        assert!((out.features[[1, 3, 4, 2]] - 2.0 * batch[[1, 3, 4, 2]]).abs() < 1e-6);
    }

    #[test]
    fn reports_channel_mismatch() {
        let model = BurnSegmentationModel::<NdArray, _>::new(
            EchoNetwork,
            NdArrayDevice::default(),
            5,
            3,
        );
        let batch = Array4::<f32>::zeros((1, 2, 2, 3));
        let err = model.predict(batch.view()).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { what: "output", .. }));
    }
}
