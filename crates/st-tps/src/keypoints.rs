// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Carrying landmarks through a warp.
//!
//! The sampling map `T` sends an output location to the input location it
//! reads from, so a landmark at input location `k` shows up at the output
//! location `q` with `T(q) = k`. The map is smooth and close to the identity
//! for the magnitudes used in training, which makes Newton's method with a
//! finite-difference Jacobian converge in a handful of steps.

use ndarray::{Array2, ArrayView2};

use crate::basis::TpsBasis;
use crate::weights::TpsWeights;
use crate::{Result, WarpError};

const MAX_ITERATIONS: usize = 64;
const TOLERANCE: f64 = 1e-9;
const JACOBIAN_STEP: f64 = 1e-6;
const SINGULAR_DET: f64 = 1e-12;

/// Solves `T(q) = target` for a single normalised point.
pub fn pull_back_point(
    basis: &TpsBasis,
    weights: &TpsWeights,
    target: [f64; 2],
    index: usize,
) -> Result<[f64; 2]> {
    let mut q = target;
    for _ in 0..MAX_ITERATIONS {
        let mapped = basis.transform_point(weights, q)?;
        let r = [mapped[0] - target[0], mapped[1] - target[1]];
        if !r[0].is_finite() || !r[1].is_finite() {
            break;
        }
        if r[0].abs().max(r[1].abs()) < TOLERANCE {
            return Ok(q);
        }

        let xp = basis.transform_point(weights, [q[0] + JACOBIAN_STEP, q[1]])?;
        let xm = basis.transform_point(weights, [q[0] - JACOBIAN_STEP, q[1]])?;
        let yp = basis.transform_point(weights, [q[0], q[1] + JACOBIAN_STEP])?;
        let ym = basis.transform_point(weights, [q[0], q[1] - JACOBIAN_STEP])?;
        let inv = 0.5 / JACOBIAN_STEP;
        let (j00, j10) = ((xp[0] - xm[0]) * inv, (xp[1] - xm[1]) * inv);
        let (j01, j11) = ((yp[0] - ym[0]) * inv, (yp[1] - ym[1]) * inv);

        let det = j00 * j11 - j01 * j10;
        let step = if det.abs() < SINGULAR_DET {
            r
        } else {
            [
                (j11 * r[0] - j01 * r[1]) / det,
                (-j10 * r[0] + j00 * r[1]) / det,
            ]
        };
        q = [q[0] - step[0], q[1] - step[1]];
    }
    Err(WarpError::KeypointDivergence {
        index,
        iterations: MAX_ITERATIONS,
    })
}

/// Pulls every row of a `[K, 2]` array of normalised points back through the
/// warp described by `weights`.
pub fn pull_back(
    basis: &TpsBasis,
    weights: &TpsWeights,
    points: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    if points.ncols() != 2 {
        return Err(WarpError::Shape(format!(
            "keypoints must be [K, 2], got {:?}",
            points.dim()
        )));
    }
    let mut out = Array2::zeros(points.dim());
    for (index, (row, mut dst)) in points
        .rows()
        .into_iter()
        .zip(out.rows_mut())
        .enumerate()
    {
        let q = pull_back_point(basis, weights, [row[0], row[1]], index)?;
        dst[0] = q[0];
        dst[1] = q[1];
    }
    Ok(out)
}
