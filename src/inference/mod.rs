//! Segmentation network seam and tile-level sliding-window inference.

mod burn_model;
mod model;
mod stitch;

pub use burn_model::{BurnSegmentationModel, SegmentationNetwork};
pub use model::{ModelError, ModelOutput, SegmentationModel};
pub use stitch::{
    PredictionAccumulator, StitchError, TilePrediction, TileStitcher, blend_kernel, window_origins,
};
