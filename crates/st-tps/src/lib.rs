// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Thin-plate-spline warps for equivariance training.
//!
//! A [`Warper`] draws two independent random TPS + affine transforms, resamples
//! an image pair through them and reports the dense pixel correspondence
//! between the two cropped outputs. The correspondence is what the dense
//! correlation loss consumes as its sampling grid.

pub mod basis;
pub mod grid;
pub mod keypoints;
pub mod sample;
pub mod warper;
pub mod weights;

use thiserror::Error;

pub use basis::{tps_u, TpsBasis, TPS_LOG_EPS};
pub use grid::{
    grid_normalize, grid_unnormalize, keypoints_normalize, spatial_grid_unnormalized, tps_grid,
};
pub use sample::grid_sample;
pub use warper::{
    stack_correspondence_grids, PairKeypoints, WarpedImage, WarpedPair, Warper, WarperConfig,
    FLOW_CONSISTENCY_TOLERANCE,
};
pub use weights::{TpsWeights, WarpNoise};

/// Errors surfaced by the warp generator.
#[derive(Debug, Error, PartialEq)]
pub enum WarpError {
    /// Raised when images, grids or keypoints have unexpected dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when a configuration value is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The flow field does not reproduce the resampling grid.
    #[error("flow field disagrees with the sampling grid by {max_error:.3e}")]
    InconsistentFlow { max_error: f64 },
    /// A keypoint could not be pulled back through the warp.
    #[error("keypoint {index} did not converge after {iterations} iterations")]
    KeypointDivergence { index: usize, iterations: usize },
}

pub type Result<T> = std::result::Result<T, WarpError>;
