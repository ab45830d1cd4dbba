// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{DveError, Result};

/// Lower clamp of feature norms before division.
pub const EPS: f64 = 1e-8;

/// Scale applied to L2-normalised features so the softmaxes stay peaked.
pub const JDT_FACTOR: f64 = 20.0;

/// Relative mismatch above which a local backward check is reported.
pub const ATOL: f64 = 1e-4;

/// How the backward pass reduces through the relayed features.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Summation {
    /// Accumulates one channel at a time into `[N, N]` and `[C, N]` buffers.
    #[default]
    ChannelLoop,
    /// Builds the full `[C, N, N]` gradient tensor. Reference path only.
    Materialized,
}

/// Parameters of the dense correlation loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseCorrConfig {
    /// Ratio between the `xxyy` grid resolution and the feature resolution.
    pub stride: usize,
    /// L2-normalise features along channels (scaled by [`JDT_FACTOR`]).
    pub norm: bool,
    /// Exponent applied to the euclidean distances.
    pub pow: f64,
    pub summation: Summation,
    /// Emit per-phase timings of the backward pass.
    pub profile: bool,
    /// Cross-check every backward stage against a reference formulation.
    pub local_checks: bool,
}

impl Default for DenseCorrConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            norm: false,
            pow: 0.5,
            summation: Summation::ChannelLoop,
            profile: false,
            local_checks: false,
        }
    }
}

impl DenseCorrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(DveError::InvalidArgument("stride must be >= 1".to_string()));
        }
        if !self.pow.is_finite() || self.pow < 0.0 {
            return Err(DveError::InvalidArgument(format!(
                "pow must be a non-negative finite number, got {}",
                self.pow
            )));
        }
        Ok(())
    }

    /// Reads the configuration stored under `section` of a JSON settings file.
    pub fn load(path: impl AsRef<Path>, section: &str) -> Result<Self> {
        let config: Self = spiral_config::load_section(path, section)?;
        config.validate()?;
        Ok(config)
    }
}
