// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Coordinate grids shared by the warp generator and the correlation loss.
//!
//! Two frames are used throughout:
//! - *normalised* coordinates in `[-1, 1]`, where `-1` is the first pixel
//!   centre and `1` the last one (align-corners convention);
//! - *pixel* coordinates `(x, y)` with `x ∈ [0, width - 1]`.
//!
//! Every grid stores the `x` component first.

use ndarray::{Array, Array2, Array3, ArrayBase, Axis, Data, Dimension, Ix2};

use crate::{Result, WarpError};

fn linspace(count: usize) -> impl Iterator<Item = f64> {
    let step = if count > 1 {
        2.0 / (count - 1) as f64
    } else {
        0.0
    };
    (0..count).map(move |k| -1.0 + step * k as f64)
}

/// Returns the `[height * width, 2]` list of normalised pixel centres in
/// row-major `(y, x)` order.
pub fn tps_grid(height: usize, width: usize) -> Array2<f64> {
    let ys: Vec<f64> = linspace(height).collect();
    let xs: Vec<f64> = linspace(width).collect();
    let mut grid = Array2::zeros((height * width, 2));
    for (row, (y, x)) in ys
        .iter()
        .flat_map(|&y| xs.iter().map(move |&x| (y, x)))
        .enumerate()
    {
        grid[[row, 0]] = x;
        grid[[row, 1]] = y;
    }
    grid
}

/// Returns the `[height, width, 2]` grid of pixel coordinates, i.e. the
/// `xxyy` lookup target consumed by the correlation loss.
pub fn spatial_grid_unnormalized(height: usize, width: usize) -> Array3<f64> {
    Array3::from_shape_fn((height, width, 2), |(y, x, axis)| {
        if axis == 0 {
            x as f64
        } else {
            y as f64
        }
    })
}

fn map_xy<S, D>(
    grid: &ArrayBase<S, D>,
    label: &'static str,
    f: impl Fn(f64, f64) -> (f64, f64),
) -> Result<Array<f64, D>>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let last = grid
        .ndim()
        .checked_sub(1)
        .ok_or_else(|| WarpError::InvalidArgument(format!("{label}: grid has no axes")))?;
    if grid.shape()[last] != 2 {
        return Err(WarpError::Shape(format!(
            "{label}: trailing axis must hold (x, y), got {:?}",
            grid.shape()
        )));
    }
    let mut out = grid.to_owned();
    for mut lane in out.lanes_mut(Axis(last)) {
        let (x, y) = f(lane[0], lane[1]);
        lane[0] = x;
        lane[1] = y;
    }
    Ok(out)
}

fn check_extent(height: usize, width: usize, label: &'static str) -> Result<()> {
    if height < 2 || width < 2 {
        return Err(WarpError::InvalidArgument(format!(
            "{label}: extent must be at least 2x2, got {height}x{width}"
        )));
    }
    Ok(())
}

/// Maps normalised coordinates to pixel coordinates of a `height x width`
/// image. Works on any grid whose trailing axis has length 2.
pub fn grid_unnormalize<S, D>(
    grid: &ArrayBase<S, D>,
    height: usize,
    width: usize,
) -> Result<Array<f64, D>>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    check_extent(height, width, "grid_unnormalize")?;
    let sx = (width - 1) as f64 / 2.0;
    let sy = (height - 1) as f64 / 2.0;
    map_xy(grid, "grid_unnormalize", |x, y| ((x + 1.0) * sx, (y + 1.0) * sy))
}

/// Inverse of [`grid_unnormalize`].
pub fn grid_normalize<S, D>(
    grid: &ArrayBase<S, D>,
    height: usize,
    width: usize,
) -> Result<Array<f64, D>>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    check_extent(height, width, "grid_normalize")?;
    let sx = 2.0 / (width - 1) as f64;
    let sy = 2.0 / (height - 1) as f64;
    map_xy(grid, "grid_normalize", |x, y| (x * sx - 1.0, y * sy - 1.0))
}

/// Normalises `[K, 2]` pixel keypoints of a `height x width` image.
pub fn keypoints_normalize<S>(
    keypoints: &ArrayBase<S, Ix2>,
    height: usize,
    width: usize,
) -> Result<Array2<f64>>
where
    S: Data<Elem = f64>,
{
    grid_normalize(keypoints, height, width)
}
