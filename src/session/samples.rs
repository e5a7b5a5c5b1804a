//! User-labelled feature blocks and the seed set they start from.

use std::collections::BTreeSet;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis, Ix2, s};
use thiserror::Error;

use crate::npy::{self, NpyError};

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Sample rectangle {rect:?} is inverted")]
    Inverted { rect: SampleRect },
    #[error("Sample rectangle {rect:?} exceeds the {height}x{width} feature map")]
    OutOfBounds {
        rect: SampleRect,
        height: usize,
        width: usize,
    },
    #[error("Sample block has {features} feature rows but {labels} labels")]
    LengthMismatch { features: usize, labels: usize },
    #[error("Failed to load seed samples: {0}")]
    Seed(#[from] NpyError),
    #[error("Seed features must be a 2-D array")]
    SeedShape,
}

/// Inclusive pixel rectangle on the current feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRect {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl SampleRect {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.bottom.saturating_sub(self.top) + 1) * (self.right.saturating_sub(self.left) + 1)
    }
}

/// Feature rows with one class label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub features: Array2<f32>,
    pub labels: Array1<usize>,
}

impl SampleBlock {
    pub fn new(features: Array2<f32>, labels: Array1<usize>) -> Result<Self, SampleError> {
        if features.nrows() != labels.len() {
            return Err(SampleError::LengthMismatch {
                features: features.nrows(),
                labels: labels.len(),
            });
        }
        Ok(Self { features, labels })
    }

    /// Copy every feature vector inside `rect`, labelling each with `class_index`.
    pub fn from_region(
        feature_map: ArrayView3<'_, f32>,
        rect: SampleRect,
        class_index: usize,
    ) -> Result<Self, SampleError> {
        let (height, width, depth) = feature_map.dim();
        if rect.top > rect.bottom || rect.left > rect.right {
            return Err(SampleError::Inverted { rect });
        }
        if rect.bottom >= height || rect.right >= width {
            return Err(SampleError::OutOfBounds {
                rect,
                height,
                width,
            });
        }
        let region = feature_map.slice(s![rect.top..=rect.bottom, rect.left..=rect.right, ..]);
        let rows = region.len() / depth.max(1);
        let features = region
            .to_owned()
            .into_shape_with_order((rows, depth))
            .map_err(|_| SampleError::LengthMismatch {
                features: rows,
                labels: rows,
            })?;
        Ok(Self {
            features,
            labels: Array1::from_elem(rows, class_index),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Load a seed set from a `(rows, features)` array and a matching label array.
pub fn load_seed_blocks(features: &Path, labels: &Path) -> Result<Vec<SampleBlock>, SampleError> {
    let x = npy::read_npy(features)?
        .into_f32()?
        .into_dimensionality::<Ix2>()
        .map_err(|_| SampleError::SeedShape)?;
    let y = npy::read_npy(labels)?.into_labels()?;
    Ok(vec![SampleBlock::new(x, Array1::from(y))?])
}

/// Sample blocks accumulated in one session, on top of the seed set.
#[derive(Debug, Clone)]
pub struct SampleStore {
    seed: Vec<SampleBlock>,
    blocks: Vec<SampleBlock>,
}

impl SampleStore {
    pub fn new(seed: Vec<SampleBlock>) -> Self {
        Self {
            blocks: seed.clone(),
            seed,
        }
    }

    pub fn push(&mut self, block: SampleBlock) {
        self.blocks.push(block);
    }

    pub fn pop(&mut self) -> Option<SampleBlock> {
        self.blocks.pop()
    }

    /// Drop every user block and start over from the seed set.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.blocks.extend(self.seed.iter().cloned());
    }

    pub fn blocks(&self) -> &[SampleBlock] {
        &self.blocks
    }

    pub fn seed(&self) -> &[SampleBlock] {
        &self.seed
    }

    /// Total labelled rows across all blocks.
    pub fn sample_count(&self) -> usize {
        self.blocks.iter().map(SampleBlock::len).sum()
    }

    pub fn distinct_classes(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|block| block.labels.iter().copied())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Stack every block into one feature matrix and label vector.
    pub fn concatenate(&self) -> Option<(Array2<f32>, Vec<usize>)> {
        let views: Vec<ArrayView2<'_, f32>> = self
            .blocks
            .iter()
            .filter(|block| !block.is_empty())
            .map(|block| block.features.view())
            .collect();
        if views.is_empty() {
            return None;
        }
        let x = ndarray::concatenate(Axis(0), &views).ok()?;
        let y = self
            .blocks
            .iter()
            .flat_map(|block| block.labels.iter().copied())
            .collect();
        Some((x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};

    fn feature_map() -> Array3<f32> {
        Array3::from_shape_fn((6, 5, 2), |(y, x, f)| (y * 10 + x) as f32 + f as f32 * 0.5)
    }

    #[test]
    fn region_rows_follow_row_major_order() {
        let map = feature_map();
        let block = SampleBlock::from_region(map.view(), SampleRect::new(1, 2, 3, 4), 2).unwrap();
        assert_eq!(block.len(), 4);
        assert_eq!(block.features.row(0).to_vec(), vec![13.0, 13.5]);
        assert_eq!(block.features.row(1).to_vec(), vec![14.0, 14.5]);
        assert_eq!(block.features.row(3).to_vec(), vec![24.0, 24.5]);
        assert!(block.labels.iter().all(|&label| label == 2));
    }

    #[test]
    fn single_pixel_rectangle_is_inclusive() {
        let map = feature_map();
        let rect = SampleRect::new(5, 5, 4, 4);
        let block = SampleBlock::from_region(map.view(), rect, 0).unwrap();
        assert_eq!(block.len(), rect.pixel_count());
        assert_eq!(block.features.row(0).to_vec(), vec![54.0, 54.5]);
    }

    #[test]
    fn rejects_out_of_bounds_and_inverted_rectangles() {
        let map = feature_map();
        assert!(matches!(
            SampleBlock::from_region(map.view(), SampleRect::new(0, 6, 0, 0), 0),
            Err(SampleError::OutOfBounds { .. })
        ));
        assert!(matches!(
            SampleBlock::from_region(map.view(), SampleRect::new(3, 2, 0, 0), 0),
            Err(SampleError::Inverted { .. })
        ));
    }

    #[test]
    fn store_reset_restores_seed_only() {
        let seed = SampleBlock::new(array![[1.0f32, 2.0]], array![3]).unwrap();
        let mut store = SampleStore::new(vec![seed.clone()]);
        store.push(SampleBlock::new(array![[0.0f32, 0.0], [1.0, 1.0]], array![0, 1]).unwrap());
        assert_eq!(store.sample_count(), 3);
        assert_eq!(store.distinct_classes(), 3);
        store.reset();
        assert_eq!(store.blocks(), &[seed]);
    }

    #[test]
    fn concatenate_stacks_blocks_in_order() {
        let mut store = SampleStore::new(Vec::new());
        assert!(store.concatenate().is_none());
        store.push(SampleBlock::new(array![[1.0f32, 2.0]], array![1]).unwrap());
        store.push(SampleBlock::new(array![[3.0f32, 4.0], [5.0, 6.0]], array![2, 2]).unwrap());
        let (x, y) = store.concatenate().unwrap();
        assert_eq!(x, array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(y, vec![1, 2, 2]);
    }

    #[test]
    fn seed_blocks_load_from_npy() {
        let dir = tempfile::tempdir().unwrap();
        let features = dir.path().join("seed_x.npy");
        let labels = dir.path().join("seed_y.npy");
        npy::write_npy(&features, array![[0.1f32, 0.2], [0.3, 0.4]].view().into_dyn()).unwrap();
        npy::write_npy(&labels, array![0.0f32, 3.0].view().into_dyn()).unwrap();
        let blocks = load_seed_blocks(&features, &labels).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].labels.to_vec(), vec![0, 3]);
    }
}
