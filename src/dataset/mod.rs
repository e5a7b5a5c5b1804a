//! Training tiles listed in a CSV index.
//!
//! Each row names an image `.npy` (HWC), a mask `.npy`, an optional border
//! `.npy` and the split the row belongs to. Paths are relative to the index's
//! base directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayD, Axis, Ix2, Ix3, concatenate};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::npy::{self, NpyDtype, NpyError};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset index {path}: {source}")]
    Index { path: PathBuf, source: csv::Error },
    #[error(transparent)]
    Npy(#[from] NpyError),
    #[error("{path} has shape {shape:?}, expected {expected}")]
    Shape {
        path: PathBuf,
        shape: Vec<usize>,
        expected: &'static str,
    },
    #[error("Border {path} does not match the image size")]
    BorderSize { path: PathBuf },
    #[error("Index {index} out of range for {len} items")]
    OutOfRange { index: usize, len: usize },
}

/// One row of the index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetRecord {
    pub img_path: PathBuf,
    pub mask_path: PathBuf,
    #[serde(default)]
    pub border_path: Option<PathBuf>,
    /// Split name, e.g. `train`, `val` or `test`.
    pub train: String,
}

/// A loaded training example.
#[derive(Debug, Clone)]
pub struct DatasetItem {
    /// `(C, H, W)`; `u8` images are scaled into `[0, 1]`.
    pub image: Array3<f32>,
    pub mask: ArrayD<u8>,
}

#[derive(Debug, Clone)]
pub struct GlacierDataset {
    base_dir: PathBuf,
    records: Vec<DatasetRecord>,
    borders: bool,
}

impl GlacierDataset {
    /// Open `base_dir/data_file`, keeping rows whose split equals `mode`.
    pub fn open(
        base_dir: &Path,
        data_file: &Path,
        mode: &str,
        borders: bool,
    ) -> Result<Self, DatasetError> {
        let records = read_index(&base_dir.join(data_file))?
            .into_iter()
            .filter(|record| record.train == mode)
            .collect::<Vec<_>>();
        debug!(
            "Opened {} '{}' rows from {}",
            records.len(),
            mode,
            data_file.display()
        );
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            records,
            borders,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[DatasetRecord] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Result<DatasetItem, DatasetError> {
        let record = self.records.get(index).ok_or(DatasetError::OutOfRange {
            index,
            len: self.records.len(),
        })?;
        let img_path = self.base_dir.join(&record.img_path);
        let mut image = load_chw_image(&img_path)?;
        if self.borders {
            if let Some(border) = record.border_path.as_ref() {
                let border_path = self.base_dir.join(border);
                let border = load_border(&border_path)?;
                let (_, h, w) = image.dim();
                if border.dim() != (h, w) {
                    return Err(DatasetError::BorderSize { path: border_path });
                }
                image = concatenate(Axis(0), &[image.view(), border.view().insert_axis(Axis(0))])
                    .map_err(NpyError::from)?;
            }
        }
        let mask = npy::read_npy(&self.base_dir.join(&record.mask_path))?.into_u8()?;
        Ok(DatasetItem { image, mask })
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<DatasetItem, DatasetError>> + '_ {
        (0..self.len()).map(|index| self.get(index))
    }
}

/// Rows per split across the whole index.
pub fn split_counts(index_path: &Path) -> Result<BTreeMap<String, usize>, DatasetError> {
    let mut counts = BTreeMap::new();
    for record in read_index(index_path)? {
        *counts.entry(record.train).or_insert(0) += 1;
    }
    Ok(counts)
}

fn read_index(path: &Path) -> Result<Vec<DatasetRecord>, DatasetError> {
    let index_err = |source| DatasetError::Index {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(index_err)?;
    reader
        .deserialize::<DatasetRecord>()
        .map(|row| row.map_err(index_err))
        .collect()
}

fn load_chw_image(path: &Path) -> Result<Array3<f32>, DatasetError> {
    let raw = npy::read_npy(path)?;
    let scale = if raw.dtype() == NpyDtype::U8 {
        1.0 / 255.0
    } else {
        1.0
    };
    let shape = raw.shape.clone();
    let values = raw.into_f32()?;
    let hwc = match values.ndim() {
        2 => values
            .into_dimensionality::<Ix2>()
            .map_err(NpyError::from)?
            .insert_axis(Axis(2)),
        3 => values.into_dimensionality::<Ix3>().map_err(NpyError::from)?,
        _ => {
            return Err(DatasetError::Shape {
                path: path.to_path_buf(),
                shape,
                expected: "(H, W) or (H, W, C)",
            });
        }
    };
    Ok(hwc.permuted_axes([2, 0, 1]).mapv(|v| v * scale))
}

fn load_border(path: &Path) -> Result<ndarray::Array2<f32>, DatasetError> {
    let raw = npy::read_npy(path)?;
    let shape = raw.shape.clone();
    raw.into_f32()?
        .into_dimensionality::<Ix2>()
        .map_err(|_| DatasetError::Shape {
            path: path.to_path_buf(),
            shape,
            expected: "(H, W)",
        })
}
