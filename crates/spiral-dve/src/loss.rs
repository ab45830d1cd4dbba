// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Forward and backward passes of the folded dense correlation loss.
//!
//! Per sample the features are handled as `[C, N]` matrices with
//! `N = height * width` locations in row-major order. The two soft matchings
//! are `[N, N]` row-stochastic matrices.

use std::time::Instant;

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, ShapeError, Zip};
use tracing::{debug, debug_span, trace, warn};

use crate::config::{DenseCorrConfig, Summation, ATOL, EPS, JDT_FACTOR};
use crate::element::Real;
use crate::gradcheck::relative_difference;
use crate::profile::Profiler;
use crate::{DveError, Result};

fn reshape_error(context: &str, err: ShapeError) -> DveError {
    DveError::Shape(format!("{context}: {err}"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Dims {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl Dims {
    fn locations(&self) -> usize {
        self.height * self.width
    }
}

fn validate_inputs<T: Real>(
    feats1: &ArrayView4<'_, T>,
    feats2: &ArrayView4<'_, T>,
    xxyy: &ArrayView3<'_, T>,
    batch_grid_u: &ArrayView4<'_, T>,
    stride: usize,
) -> Result<Dims> {
    let (batch, channels, height, width) = feats1.dim();
    if batch == 0 || channels == 0 || height == 0 || width == 0 {
        return Err(DveError::InvalidArgument(format!(
            "feature maps must be non-empty, got {:?}",
            feats1.shape()
        )));
    }
    if feats2.dim() != feats1.dim() {
        return Err(DveError::Shape(format!(
            "feats1 is {:?} but feats2 is {:?}",
            feats1.shape(),
            feats2.shape()
        )));
    }
    let expected_grid = (height * stride, width * stride, 2);
    if xxyy.dim() != expected_grid {
        return Err(DveError::Shape(format!(
            "xxyy must be {expected_grid:?} for {height}x{width} features at stride {stride}, got {:?}",
            xxyy.shape()
        )));
    }
    let expected_u = (batch, height, width, 2);
    if batch_grid_u.dim() != expected_u {
        return Err(DveError::Shape(format!(
            "batch_grid_u must be {expected_u:?}, got {:?}",
            batch_grid_u.shape()
        )));
    }
    Ok(Dims {
        batch,
        channels,
        height,
        width,
    })
}

/// Pixel coordinates of every `stride`-th location of `xxyy`, flattened
/// row-major to `[h * w, 2]`. These are the target locations the loss
/// measures distances to.
pub fn strided_targets<T: Real>(xxyy: ArrayView3<'_, T>, stride: usize) -> Result<Array2<T>> {
    if stride == 0 {
        return Err(DveError::InvalidArgument("stride must be >= 1".to_string()));
    }
    if xxyy.dim().2 != 2 {
        return Err(DveError::Shape(format!(
            "xxyy must be [H, W, 2], got {:?}",
            xxyy.shape()
        )));
    }
    let strided = xxyy.slice(s![..;stride, ..;stride, ..]);
    let (h, w, _) = strided.dim();
    strided
        .to_shape((h * w, 2))
        .map(|targets| targets.into_owned())
        .map_err(|err| reshape_error("strided targets", err))
}

/// `||source_i - target_j||^pow` for every pair of locations.
fn distances<T: Real>(
    grid_u: ArrayView3<'_, T>,
    targets: &Array2<T>,
    pow: T,
) -> Result<Array2<T>> {
    let (h, w, _) = grid_u.dim();
    let sources = grid_u
        .to_shape((h * w, 2))
        .map_err(|err| reshape_error("sampling grid", err))?;
    Ok(Array2::from_shape_fn(
        (sources.nrows(), targets.nrows()),
        |(i, j)| {
            let dx = sources[[i, 0]] - targets[[j, 0]];
            let dy = sources[[i, 1]] - targets[[j, 1]];
            (dx * dx + dy * dy).sqrt().powf(pow)
        },
    ))
}

fn softmax_rows<T: Real>(mut logits: Array2<T>) -> Array2<T> {
    for mut row in logits.rows_mut() {
        let max = row
            .iter()
            .fold(T::neg_infinity(), |m, &v| if v > m { v } else { m });
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
    logits
}

/// Vector-Jacobian product of a row softmax: `p * (g - <g, p>)` per row.
fn softmax_rows_backward<T: Real>(probs: &Array2<T>, grad: &Array2<T>) -> Array2<T> {
    let mut out = Array2::zeros(probs.raw_dim());
    Zip::from(out.rows_mut())
        .and(probs.rows())
        .and(grad.rows())
        .for_each(|mut row, p, g| {
            let dot = p.dot(&g);
            Zip::from(&mut row)
                .and(&p)
                .and(&g)
                .for_each(|o, &p, &g| *o = p * (g - dot));
        });
    out
}

/// Same product through the explicit `diag(p) - p pᵀ` Jacobian of each row.
fn softmax_rows_backward_reference<T: Real>(probs: &Array2<T>, grad: &Array2<T>) -> Array2<T> {
    let (rows, cols) = probs.dim();
    let mut out = Array2::zeros((rows, cols));
    for i in 0..rows {
        for k in 0..cols {
            let mut acc = T::from_f64(0.0);
            for j in 0..cols {
                let delta = if j == k { probs[[i, j]] } else { T::from_f64(0.0) };
                acc += grad[[i, j]] * (delta - probs[[i, j]] * probs[[i, k]]);
            }
            out[[i, k]] = acc;
        }
    }
    out
}

/// One sample's features as `[C, N]`, with the normalised copy the
/// correlations are computed from.
struct Features<T> {
    raw: Array2<T>,
    scaled: Array2<T>,
    norms: Option<Array1<T>>,
}

impl<T: Real> Features<T> {
    fn new(feats: &ArrayView4<'_, T>, sample: usize, dims: Dims, norm: bool) -> Result<Self> {
        let raw = feats
            .index_axis(Axis(0), sample)
            .to_shape((dims.channels, dims.locations()))
            .map_err(|err| reshape_error("feature map", err))?
            .into_owned();
        if !norm {
            return Ok(Self {
                scaled: raw.clone(),
                raw,
                norms: None,
            });
        }
        let eps = T::from_f64(EPS);
        let jdt = T::from_f64(JDT_FACTOR);
        let norms = raw.map_axis(Axis(0), |col| {
            col.iter().map(|&v| v * v).sum::<T>().sqrt().max(eps)
        });
        let mut scaled = raw.clone();
        Zip::from(scaled.columns_mut())
            .and(&norms)
            .for_each(|mut col, &n| col.mapv_inplace(|v| v / n * jdt));
        Ok(Self {
            raw,
            scaled,
            norms: Some(norms),
        })
    }

    /// Pulls a gradient w.r.t. the scaled features back to the raw ones.
    fn backward(&self, grad_scaled: &Array2<T>) -> Array2<T> {
        let mut grad = grad_scaled.clone();
        let Some(norms) = &self.norms else {
            return grad;
        };
        let jdt = T::from_f64(JDT_FACTOR);
        Zip::from(grad.columns_mut())
            .and(self.raw.columns())
            .and(norms)
            .for_each(|mut g, f, &n| {
                g.mapv_inplace(|v| v / n);
                let scale = g.dot(&f) / (n * n);
                Zip::from(&mut g)
                    .and(&f)
                    .for_each(|g, &f| *g = jdt * (*g - scale * f));
            });
        grad
    }

    /// `jdt / n * (g - u <u, g>)` with `u = f / n`.
    fn backward_reference(&self, grad_scaled: &Array2<T>) -> Array2<T> {
        let mut grad = grad_scaled.clone();
        let Some(norms) = &self.norms else {
            return grad;
        };
        let jdt = T::from_f64(JDT_FACTOR);
        Zip::from(grad.columns_mut())
            .and(self.raw.columns())
            .and(norms)
            .for_each(|mut g, f, &n| {
                let u = f.mapv(|v| v / n);
                let proj = u.dot(&g);
                Zip::from(&mut g)
                    .and(&u)
                    .for_each(|g, &u| *g = jdt / n * (*g - u * proj));
            });
        grad
    }
}

/// Forward intermediates of one sample.
struct SampleForward<T> {
    f1: Features<T>,
    f2: Features<T>,
    fa: Features<T>,
    smcorr: Array2<T>,
    f1_via_fa: Array2<T>,
    smcorr2: Array2<T>,
}

/// Gradient contributions of one sample, each `[C, N]`.
struct SampleGrads<T> {
    source: Array2<T>,
    auxiliary: Array2<T>,
    target: Array2<T>,
    failed_checks: usize,
}

/// Backward through `f1_via_fa = fa · smcorrᵀ`, one channel at a time.
/// Peak extra memory is one `[N, N]` and one `[C, N]` buffer.
fn relay_backward_channel_loop<T: Real>(
    grad_relayed: &Array2<T>,
    aux: &Array2<T>,
    smcorr: &Array2<T>,
) -> (Array2<T>, Array2<T>) {
    let channels = grad_relayed.nrows();
    let mut grad_smcorr = Array2::zeros(smcorr.raw_dim());
    let mut grad_aux = Array2::zeros((channels, aux.ncols()));
    for c in 0..channels {
        let g = grad_relayed.row(c);
        let fa = aux.row(c);
        Zip::from(grad_smcorr.rows_mut())
            .and(&g)
            .for_each(|mut row, &gi| row.scaled_add(gi, &fa));
        grad_aux.row_mut(c).assign(&smcorr.t().dot(&g));
    }
    (grad_smcorr, grad_aux)
}

/// Backward through the same product via the full `[C, N, N]` gradient of the
/// per-channel weighted terms.
fn relay_backward_materialized<T: Real>(
    grad_relayed: &Array2<T>,
    aux: &Array2<T>,
    smcorr: &Array2<T>,
) -> (Array2<T>, Array2<T>) {
    let (channels, n) = grad_relayed.dim();
    let m = smcorr.ncols();
    let expanded = Array3::from_shape_fn((channels, n, m), |(c, i, _)| grad_relayed[[c, i]]);
    let grad_smcorr = (&expanded * &aux.view().insert_axis(Axis(1))).sum_axis(Axis(0));
    let grad_aux = (&expanded * &smcorr.view().insert_axis(Axis(0))).sum_axis(Axis(1));
    (grad_smcorr, grad_aux)
}

fn check_stage<T: Real>(
    stage: &'static str,
    sample: usize,
    analytic: &Array2<T>,
    reference: &Array2<T>,
) -> usize {
    let rel = relative_difference(analytic, reference);
    if rel > ATOL {
        warn!(stage, sample, rel, "backward stage disagrees with its reference");
        1
    } else {
        trace!(stage, sample, rel, "backward stage verified");
        0
    }
}

fn accumulate<T: Real>(
    grads: &mut Array4<T>,
    sample: usize,
    contribution: &Array2<T>,
    dims: Dims,
) -> Result<()> {
    let contribution = contribution
        .view()
        .into_shape_with_order((dims.channels, dims.height, dims.width))
        .map_err(|err| reshape_error("gradient contribution", err))?;
    let mut dst = grads.index_axis_mut(Axis(0), sample);
    dst += &contribution;
    Ok(())
}

#[cfg(feature = "parallel")]
fn for_each_sample<R, F>(batch: usize, f: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(usize) -> Result<R> + Sync + Send,
{
    use rayon::prelude::*;

    if spiral_config::determinism::lock_reduction_order() {
        return (0..batch).map(f).collect();
    }
    (0..batch).into_par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn for_each_sample<R, F>(batch: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(usize) -> Result<R>,
{
    (0..batch).map(f).collect()
}

/// Gradients of the loss w.r.t. both feature batches.
#[derive(Clone, Debug)]
pub struct DenseCorrGrads<T> {
    pub feats1: Array4<T>,
    pub feats2: Array4<T>,
    /// Number of backward stages that disagreed with their reference when
    /// `local_checks` is enabled.
    pub failed_checks: usize,
}

/// The dense correlation loss for one configuration.
#[derive(Clone, Debug, Default)]
pub struct DenseCorrLoss {
    config: DenseCorrConfig,
}

impl DenseCorrLoss {
    pub fn new(config: DenseCorrConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DenseCorrConfig {
        &self.config
    }

    /// Validates the inputs and captures them for a later backward pass
    /// without evaluating the loss.
    pub fn bind<'a, T: Real>(
        &self,
        feats1: ArrayView4<'a, T>,
        feats2: ArrayView4<'a, T>,
        xxyy: ArrayView3<'a, T>,
        batch_grid_u: ArrayView4<'a, T>,
    ) -> Result<DenseCorrState<'a, T>> {
        let dims = validate_inputs(&feats1, &feats2, &xxyy, &batch_grid_u, self.config.stride)?;
        Ok(DenseCorrState {
            feats1,
            feats2,
            xxyy,
            batch_grid_u,
            config: self.config.clone(),
            dims,
        })
    }

    /// Evaluates the mean per-location expected distance.
    ///
    /// `feats1` and `feats2` are `[B, C, h, w]`, `xxyy` is
    /// `[h * stride, w * stride, 2]` and `batch_grid_u` is `[B, h, w, 2]`,
    /// both in the same pixel frame.
    pub fn forward<'a, T: Real>(
        &self,
        feats1: ArrayView4<'a, T>,
        feats2: ArrayView4<'a, T>,
        xxyy: ArrayView3<'a, T>,
        batch_grid_u: ArrayView4<'a, T>,
    ) -> Result<(T, DenseCorrState<'a, T>)> {
        let state = self.bind(feats1, feats2, xxyy, batch_grid_u)?;
        let loss = state.evaluate()?;
        Ok((loss, state))
    }
}

/// Inputs of one loss evaluation, kept for the backward pass.
#[derive(Clone, Debug)]
pub struct DenseCorrState<'a, T> {
    feats1: ArrayView4<'a, T>,
    feats2: ArrayView4<'a, T>,
    xxyy: ArrayView3<'a, T>,
    batch_grid_u: ArrayView4<'a, T>,
    config: DenseCorrConfig,
    dims: Dims,
}

impl<'a, T: Real> DenseCorrState<'a, T> {
    pub fn config(&self) -> &DenseCorrConfig {
        &self.config
    }

    fn normaliser(&self) -> T {
        T::from_f64((self.dims.locations() * self.dims.batch) as f64)
    }

    fn sample_forward(&self, b: usize, profiler: &mut Profiler) -> Result<SampleForward<T>> {
        let norm = self.config.norm;
        let a = (b + 1) % self.dims.batch;
        let f1 = Features::new(&self.feats1, b, self.dims, norm)?;
        let f2 = Features::new(&self.feats2, b, self.dims, norm)?;
        let fa = Features::new(&self.feats1, a, self.dims, norm)?;
        profiler.lap("fwd-norm");

        let smcorr = softmax_rows(f1.scaled.t().dot(&fa.scaled));
        profiler.lap("f1-aux-correlation");

        let f1_via_fa = fa.scaled.dot(&smcorr.t());
        let smcorr2 = softmax_rows(f1_via_fa.t().dot(&f2.scaled));
        profiler.lap("softmax");

        Ok(SampleForward {
            f1,
            f2,
            fa,
            smcorr,
            f1_via_fa,
            smcorr2,
        })
    }

    fn evaluate(&self) -> Result<T> {
        let dims = self.dims;
        let _span = debug_span!(
            "dense_corr_forward",
            batch = dims.batch,
            channels = dims.channels,
            height = dims.height,
            width = dims.width
        )
        .entered();
        let targets = strided_targets(self.xxyy, self.config.stride)?;
        let pow = T::from_f64(self.config.pow);

        let partials = for_each_sample(dims.batch, |b| -> Result<T> {
            let mut profiler = Profiler::new(false);
            let fwd = self.sample_forward(b, &mut profiler)?;
            let diff = distances(self.batch_grid_u.index_axis(Axis(0), b), &targets, pow)?;
            Ok(Zip::from(&diff)
                .and(&fwd.smcorr2)
                .fold(T::from_f64(0.0), |acc, &d, &p| acc + d * p))
        })?;

        let loss = partials.into_iter().sum::<T>() / self.normaliser();
        debug!(loss = loss.to_f64(), "dense correlation forward");
        Ok(loss)
    }

    fn sample_backward(
        &self,
        b: usize,
        targets: &Array2<T>,
        grad_loss: T,
        pow: T,
    ) -> Result<(SampleGrads<T>, Profiler)> {
        let checks = self.config.local_checks;
        let mut failed_checks = 0;
        let mut profiler = Profiler::new(self.config.profile);

        let diff = distances(self.batch_grid_u.index_axis(Axis(0), b), targets, pow)?;
        profiler.lap("diff-grid");
        let grad_smcorr2 = diff.mapv(|d| d * grad_loss);
        drop(diff);
        profiler.lap("scale-feats");

        let fwd = self.sample_forward(b, &mut profiler)?;
        let grad_corr2 = softmax_rows_backward(&fwd.smcorr2, &grad_smcorr2);
        if checks {
            let reference = softmax_rows_backward_reference(&fwd.smcorr2, &grad_smcorr2);
            failed_checks += check_stage("smax-corr2", b, &grad_corr2, &reference);
        }
        drop(grad_smcorr2);
        profiler.lap("softmax");

        let grad_f1_via_fa = fwd.f2.scaled.dot(&grad_corr2.t());
        let grad_f2_scaled = fwd.f1_via_fa.dot(&grad_corr2);
        drop(grad_corr2);
        profiler.lap("corr-back");

        let (grad_smcorr, grad_fa_relay) = match self.config.summation {
            Summation::ChannelLoop => {
                relay_backward_channel_loop(&grad_f1_via_fa, &fwd.fa.scaled, &fwd.smcorr)
            }
            Summation::Materialized => {
                relay_backward_materialized(&grad_f1_via_fa, &fwd.fa.scaled, &fwd.smcorr)
            }
        };
        if checks {
            let smcorr_ref = grad_f1_via_fa.t().dot(&fwd.fa.scaled);
            let aux_ref = grad_f1_via_fa.dot(&fwd.smcorr);
            failed_checks += check_stage("relay-smcorr", b, &grad_smcorr, &smcorr_ref);
            failed_checks += check_stage("relay-aux", b, &grad_fa_relay, &aux_ref);
        }
        profiler.lap("relay-back");

        let grad_corr = softmax_rows_backward(&fwd.smcorr, &grad_smcorr);
        if checks {
            let reference = softmax_rows_backward_reference(&fwd.smcorr, &grad_smcorr);
            failed_checks += check_stage("smax-corr", b, &grad_corr, &reference);
        }
        drop(grad_smcorr);
        profiler.lap("softmax");

        let grad_f1_scaled = fwd.fa.scaled.dot(&grad_corr.t());
        let mut grad_fa_scaled = fwd.f1.scaled.dot(&grad_corr);
        grad_fa_scaled += &grad_fa_relay;
        profiler.lap("corr-back");

        let source = fwd.f1.backward(&grad_f1_scaled);
        let auxiliary = fwd.fa.backward(&grad_fa_scaled);
        let target = fwd.f2.backward(&grad_f2_scaled);
        if checks && self.config.norm {
            let pairs = [
                ("norm-f1", &fwd.f1, &grad_f1_scaled, &source),
                ("norm-fa", &fwd.fa, &grad_fa_scaled, &auxiliary),
                ("norm-f2", &fwd.f2, &grad_f2_scaled, &target),
            ];
            for (stage, features, grad_scaled, analytic) in pairs {
                let reference = features.backward_reference(grad_scaled);
                failed_checks += check_stage(stage, b, analytic, &reference);
            }
        }
        profiler.lap("norm-back");

        Ok((
            SampleGrads {
                source,
                auxiliary,
                target,
                failed_checks,
            },
            profiler,
        ))
    }

    /// Gradients of `grad_output * loss` w.r.t. `feats1` and `feats2`.
    ///
    /// Every `[N, N]` intermediate is recomputed per sample. `feats1[b]`
    /// receives both its source contribution from sample `b` and its
    /// auxiliary contribution from sample `b - 1`.
    pub fn backward(self, grad_output: T) -> Result<DenseCorrGrads<T>> {
        if !grad_output.is_finite() {
            return Err(DveError::InvalidArgument(format!(
                "upstream gradient must be finite, got {grad_output}"
            )));
        }
        let started = self.config.profile.then(Instant::now);
        let dims = self.dims;
        let _span = debug_span!("dense_corr_backward", batch = dims.batch).entered();
        let mut profiler = Profiler::new(self.config.profile);

        let targets = strided_targets(self.xxyy, self.config.stride)?;
        let grad_loss = grad_output / self.normaliser();
        let pow = T::from_f64(self.config.pow);
        let mut grad_feats1 = Array4::zeros(self.feats1.raw_dim());
        let mut grad_feats2 = Array4::zeros(self.feats2.raw_dim());
        profiler.lap("back-init");

        let contributions =
            for_each_sample(dims.batch, |b| self.sample_backward(b, &targets, grad_loss, pow))?;
        profiler.restart();

        let mut failed_checks = 0;
        for (b, (grads, sample_profile)) in contributions.into_iter().enumerate() {
            let a = (b + 1) % dims.batch;
            accumulate(&mut grad_feats1, b, &grads.source, dims)?;
            accumulate(&mut grad_feats1, a, &grads.auxiliary, dims)?;
            accumulate(&mut grad_feats2, b, &grads.target, dims)?;
            failed_checks += grads.failed_checks;
            profiler.absorb(sample_profile);
        }
        profiler.lap("feat-assign");

        if let Some(started) = started {
            profiler.report("dense_corr_backward", started.elapsed());
        }
        if failed_checks > 0 {
            warn!(failed_checks, "dense correlation backward failed local checks");
        }
        Ok(DenseCorrGrads {
            feats1: grad_feats1,
            feats2: grad_feats2,
            failed_checks,
        })
    }
}

/// Evaluates the loss once.
pub fn dense_corr_loss<T: Real>(
    feats1: ArrayView4<'_, T>,
    feats2: ArrayView4<'_, T>,
    xxyy: ArrayView3<'_, T>,
    batch_grid_u: ArrayView4<'_, T>,
    config: &DenseCorrConfig,
) -> Result<T> {
    let loss = DenseCorrLoss::new(config.clone())?;
    let (value, _) = loss.forward(
        feats1.view(),
        feats2.view(),
        xxyy.view(),
        batch_grid_u.view(),
    )?;
    Ok(value)
}

/// Gradients of `grad_output * loss` without evaluating the loss itself.
pub fn dense_corr_backward<T: Real>(
    feats1: ArrayView4<'_, T>,
    feats2: ArrayView4<'_, T>,
    xxyy: ArrayView3<'_, T>,
    batch_grid_u: ArrayView4<'_, T>,
    config: &DenseCorrConfig,
    grad_output: T,
) -> Result<DenseCorrGrads<T>> {
    DenseCorrLoss::new(config.clone())?
        .bind(feats1.view(), feats2.view(), xxyy.view(), batch_grid_u.view())?
        .backward(grad_output)
}
