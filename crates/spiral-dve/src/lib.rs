// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense equivariance loss over batches of spatial feature maps.
//!
//! Every source location of sample `b` is softly matched to the auxiliary
//! sample `(b + 1) % B`, the matched auxiliary features are relayed back, and
//! the relayed features are softly matched against the warped target of `b`.
//! The loss is the expected distance, under that second matching, between a
//! location's known warped position and the target locations.
//!
//! [`DenseCorrLoss::forward`] returns the scalar loss together with a
//! [`DenseCorrState`] that borrows the inputs; [`DenseCorrState::backward`]
//! consumes it and recomputes every `[N, N]` intermediate per sample instead
//! of keeping them alive between the two passes.

pub mod config;
pub mod element;
pub mod gradcheck;
pub mod loss;
mod profile;

use spiral_config::SettingsError;
use thiserror::Error;

pub use config::{DenseCorrConfig, Summation, ATOL, EPS, JDT_FACTOR};
pub use element::Real;
pub use gradcheck::{
    check_gradients, numerical_gradients, relative_difference, GradCheckReport, GradCheckTolerance,
};
pub use loss::{
    dense_corr_backward, dense_corr_loss, strided_targets, DenseCorrGrads, DenseCorrLoss,
    DenseCorrState,
};

/// Errors surfaced by the dense correlation loss.
#[derive(Debug, Error)]
pub enum DveError {
    /// Raised when features and grids disagree in batch, channel or
    /// resolution.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when a parameter (stride, pow, upstream gradient) is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub type Result<T> = std::result::Result<T, DveError>;
