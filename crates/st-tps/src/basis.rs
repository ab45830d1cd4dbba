// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Thin-plate-spline basis computed once per output resolution.

use ndarray::{s, Array2, Array3, ArrayView2};

use crate::grid::tps_grid;
use crate::weights::TpsWeights;
use crate::{Result, WarpError};

/// Offset inside the logarithm of the TPS radial kernel.
pub const TPS_LOG_EPS: f64 = 1e-5;

#[inline]
fn radial(d2: f64) -> f64 {
    d2 * (d2 + TPS_LOG_EPS).ln()
}

/// Evaluates the radial kernel `U = D * ln(D + eps)` between every point of
/// `a` (`[n, 2]`) and every point of `b` (`[m, 2]`), with `D` the squared
/// Euclidean distance.
pub fn tps_u(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        let dx = a[[i, 0]] - b[[j, 0]];
        let dy = a[[i, 1]] - b[[j, 1]];
        radial(dx * dx + dy * dy)
    })
}

/// Control-point layout and design matrix for one `height x width` output.
///
/// The design matrix `F` has one row per output pixel laid out as
/// `[U(pixel, ctrl_0..ctrl_n) | 1 | x | y]`, so that `F · W` with a
/// [`TpsWeights`] matrix yields the normalised sampling location of every
/// pixel.
#[derive(Clone, Debug)]
pub struct TpsBasis {
    height: usize,
    width: usize,
    per_axis: usize,
    grid_pixels: Array2<f64>,
    grid_ctrlpts: Array2<f64>,
    u_ctrlpts: Array2<f64>,
    design: Array2<f64>,
}

impl TpsBasis {
    /// Lays out a `per_axis x per_axis` control grid over `[-1, 1]²`.
    pub fn new(height: usize, width: usize, per_axis: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(WarpError::InvalidArgument(format!(
                "tps basis needs a non-empty image, got {height}x{width}"
            )));
        }
        if per_axis < 2 {
            return Err(WarpError::InvalidArgument(format!(
                "tps basis needs at least 2 control points per axis, got {per_axis}"
            )));
        }
        let grid_pixels = tps_grid(height, width);
        let grid_ctrlpts = tps_grid(per_axis, per_axis);
        let u_ctrlpts = tps_u(grid_ctrlpts.view(), grid_ctrlpts.view());
        let u_pixels_ctrlpts = tps_u(grid_pixels.view(), grid_ctrlpts.view());

        let npixels = height * width;
        let nctrl = grid_ctrlpts.nrows();
        let mut design = Array2::zeros((npixels, nctrl + 3));
        design.slice_mut(s![.., ..nctrl]).assign(&u_pixels_ctrlpts);
        design.column_mut(nctrl).fill(1.0);
        design.slice_mut(s![.., nctrl + 1..]).assign(&grid_pixels);

        tracing::trace!(height, width, nctrl, "built tps basis");
        Ok(Self {
            height,
            width,
            per_axis,
            grid_pixels,
            grid_ctrlpts,
            u_ctrlpts,
            design,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Total number of control points (`per_axis²`).
    pub fn num_control_points(&self) -> usize {
        self.per_axis * self.per_axis
    }

    /// Normalised pixel centres, `[height * width, 2]`.
    pub fn grid_pixels(&self) -> ArrayView2<'_, f64> {
        self.grid_pixels.view()
    }

    /// Normalised control points, `[nctrl, 2]`.
    pub fn grid_ctrlpts(&self) -> ArrayView2<'_, f64> {
        self.grid_ctrlpts.view()
    }

    /// Kernel matrix between control points, `[nctrl, nctrl]`.
    pub fn u_ctrlpts(&self) -> ArrayView2<'_, f64> {
        self.u_ctrlpts.view()
    }

    pub fn design(&self) -> ArrayView2<'_, f64> {
        self.design.view()
    }

    fn check_weights(&self, weights: &TpsWeights) -> Result<()> {
        if weights.num_control_points() != self.num_control_points() {
            return Err(WarpError::Shape(format!(
                "weights carry {} control points, basis has {}",
                weights.num_control_points(),
                self.num_control_points()
            )));
        }
        Ok(())
    }

    /// Normalised sampling location of every output pixel, `[height, width, 2]`.
    pub fn sampling_grid(&self, weights: &TpsWeights) -> Result<Array3<f64>> {
        self.check_weights(weights)?;
        let flat = self.design.dot(&weights.matrix());
        flat.into_shape_with_order((self.height, self.width, 2))
            .map_err(|err| WarpError::Shape(format!("sampling grid reshape failed: {err}")))
    }

    /// The sampling grid of the identity warp, `[height, width, 2]`.
    pub fn identity_grid(&self) -> Result<Array3<f64>> {
        self.grid_pixels
            .clone()
            .into_shape_with_order((self.height, self.width, 2))
            .map_err(|err| WarpError::Shape(format!("identity grid reshape failed: {err}")))
    }

    /// Evaluates the TPS + affine map at an arbitrary normalised point.
    pub fn transform_point(&self, weights: &TpsWeights, point: [f64; 2]) -> Result<[f64; 2]> {
        self.check_weights(weights)?;
        let w = weights.matrix();
        let nctrl = self.num_control_points();
        let mut out = [
            w[[nctrl, 0]] + point[0] * w[[nctrl + 1, 0]] + point[1] * w[[nctrl + 2, 0]],
            w[[nctrl, 1]] + point[0] * w[[nctrl + 1, 1]] + point[1] * w[[nctrl + 2, 1]],
        ];
        for (k, ctrl) in self.grid_ctrlpts.rows().into_iter().enumerate() {
            let dx = point[0] - ctrl[0];
            let dy = point[1] - ctrl[1];
            let u = radial(dx * dx + dy * dy);
            out[0] += u * w[[k, 0]];
            out[1] += u * w[[k, 1]];
        }
        Ok(out)
    }
}
