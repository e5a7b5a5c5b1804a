use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use glacier_tool::config::InferenceSettings;
use glacier_tool::inference::{ModelError, ModelOutput, SegmentationModel, TileStitcher};
use ndarray::{Array3, Array4, ArrayView4};

const TILE_SIZES: [usize; 2] = [480, 960];

/// Cheap stand-in network so the bench measures windowing and blending.
struct ScaleModel {
    features: usize,
}

impl SegmentationModel for ScaleModel {
    fn output_channels(&self) -> usize {
        5
    }

    fn output_features(&self) -> usize {
        self.features
    }

    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<ModelOutput, ModelError> {
        let (n, h, w, c) = batch.dim();
        let output =
            Array4::from_shape_fn((n, h, w, 5), |(i, y, x, k)| batch[[i, y, x, k % c]] * 0.5);
        let features = Array4::from_shape_fn((n, h, w, self.features), |(i, y, x, f)| {
            batch[[i, y, x, f % c]]
        });
        Ok(ModelOutput { output, features })
    }
}

fn bench_tile_stitching(c: &mut Criterion) {
    let settings = InferenceSettings {
        output_features: 16,
        ..InferenceSettings::default()
    };
    let stitcher = TileStitcher::new(&settings).expect("stitcher");
    let model = ScaleModel { features: 16 };
    let mut group = c.benchmark_group("stitch_tile");
    group.sample_size(10);
    for size in TILE_SIZES {
        let tile = Array3::from_shape_fn((size, size, 4), |(y, x, ch)| {
            ((y + x + ch) % 255) as f32 / 255.0
        });
        group.bench_with_input(BenchmarkId::from_parameter(size), &tile, |b, tile| {
            b.iter(|| {
                stitcher
                    .run(&model, black_box(tile.view()))
                    .expect("stitch tile");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tile_stitching);
criterion_main!(benches);
