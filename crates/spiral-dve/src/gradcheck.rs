// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Finite-difference verification of the analytic backward pass.

use ndarray::{Array4, ArrayBase, ArrayView3, ArrayView4, Data, Dimension, Zip};
use tracing::debug;

use crate::config::EPS;
use crate::element::Real;
use crate::loss::{DenseCorrGrads, DenseCorrLoss};
use crate::{DveError, Result};

/// `Σ|a - b| / max(mean|b|, EPS)`, with `b` the reference. Arrays of
/// different shapes are infinitely far apart.
pub fn relative_difference<T, S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f64
where
    T: Real,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
{
    if a.shape() != b.shape() {
        return f64::INFINITY;
    }
    let mut abs_diff = 0.0;
    let mut abs_ref = 0.0;
    Zip::from(a).and(b).for_each(|&x, &y| {
        abs_diff += (x - y).to_f64().abs();
        abs_ref += y.to_f64().abs();
    });
    let mean_ref = abs_ref / b.len().max(1) as f64;
    abs_diff / mean_ref.max(EPS)
}

fn central_differences(
    values: ArrayView4<'_, f64>,
    eps: f64,
    grad_output: f64,
    mut eval: impl FnMut(ArrayView4<'_, f64>) -> Result<f64>,
) -> Result<Array4<f64>> {
    let mut perturbed = values.to_owned();
    let mut grads = Array4::zeros(values.raw_dim());
    for (idx, slot) in grads.indexed_iter_mut() {
        let original = perturbed[idx];
        perturbed[idx] = original + eps;
        let plus = eval(perturbed.view())?;
        perturbed[idx] = original - eps;
        let minus = eval(perturbed.view())?;
        perturbed[idx] = original;
        *slot = grad_output * (plus - minus) / (2.0 * eps);
    }
    Ok(grads)
}

/// Central-difference gradients of `grad_output * loss`, one forward pass
/// pair per feature element.
pub fn numerical_gradients(
    loss: &DenseCorrLoss,
    feats1: ArrayView4<'_, f64>,
    feats2: ArrayView4<'_, f64>,
    xxyy: ArrayView3<'_, f64>,
    batch_grid_u: ArrayView4<'_, f64>,
    grad_output: f64,
    eps: f64,
) -> Result<DenseCorrGrads<f64>> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(DveError::InvalidArgument(format!(
            "finite-difference step must be > 0, got {eps}"
        )));
    }
    loss.bind(feats1.view(), feats2.view(), xxyy.view(), batch_grid_u.view())?;

    let grad1 = central_differences(feats1, eps, grad_output, |perturbed| {
        Ok(loss
            .forward(perturbed.reborrow(), feats2.view(), xxyy.view(), batch_grid_u.view())?
            .0)
    })?;
    let grad2 = central_differences(feats2, eps, grad_output, |perturbed| {
        Ok(loss
            .forward(feats1.view(), perturbed.reborrow(), xxyy.view(), batch_grid_u.view())?
            .0)
    })?;
    Ok(DenseCorrGrads {
        feats1: grad1,
        feats2: grad2,
        failed_checks: 0,
    })
}

/// Acceptance thresholds of [`check_gradients`]. An element passes when
/// `|analytic - numeric| <= atol + rtol * |numeric|`.
#[derive(Clone, Debug, PartialEq)]
pub struct GradCheckTolerance {
    pub eps: f64,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for GradCheckTolerance {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            atol: 1e-5,
            rtol: 1e-3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GradCheckReport {
    pub max_abs_error: f64,
    /// Largest `|analytic - numeric| / max(|numeric|, atol)`.
    pub max_rel_error: f64,
    pub rel_diff_feats1: f64,
    pub rel_diff_feats2: f64,
    pub passed: bool,
}

/// Compares the analytic gradients against central differences.
pub fn check_gradients(
    loss: &DenseCorrLoss,
    feats1: ArrayView4<'_, f64>,
    feats2: ArrayView4<'_, f64>,
    xxyy: ArrayView3<'_, f64>,
    batch_grid_u: ArrayView4<'_, f64>,
    tolerance: &GradCheckTolerance,
) -> Result<GradCheckReport> {
    let analytic = loss
        .bind(feats1.view(), feats2.view(), xxyy.view(), batch_grid_u.view())?
        .backward(1.0)?;
    let numeric = numerical_gradients(
        loss,
        feats1,
        feats2,
        xxyy,
        batch_grid_u,
        1.0,
        tolerance.eps,
    )?;

    let mut report = GradCheckReport {
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        rel_diff_feats1: relative_difference(&analytic.feats1, &numeric.feats1),
        rel_diff_feats2: relative_difference(&analytic.feats2, &numeric.feats2),
        passed: true,
    };
    let pairs = [
        (&analytic.feats1, &numeric.feats1),
        (&analytic.feats2, &numeric.feats2),
    ];
    for (a, n) in pairs {
        Zip::from(a).and(n).for_each(|&a, &n| {
            let abs = (a - n).abs();
            report.max_abs_error = report.max_abs_error.max(abs);
            report.max_rel_error = report.max_rel_error.max(abs / n.abs().max(tolerance.atol));
            let within = abs <= tolerance.atol + tolerance.rtol * n.abs();
            report.passed &= within;
        });
    }
    debug!(
        max_abs_error = report.max_abs_error,
        max_rel_error = report.max_rel_error,
        passed = report.passed,
        "gradient check"
    );
    Ok(report)
}
