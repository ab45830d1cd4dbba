// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Bilinear resampling and center crops.

use ndarray::{s, Array3, ArrayBase, ArrayView3, Data, Ix3};

use crate::{Result, WarpError};

/// Resamples a `[C, H, W]` image at the normalised locations of a
/// `[Ho, Wo, 2]` grid and returns a `[C, Ho, Wo]` image.
///
/// Grid coordinates follow the align-corners convention (`-1` and `1` hit the
/// centres of the border pixels). Bilinear taps that fall outside the image
/// contribute zero, so locations far outside the image come back black and
/// locations within one pixel of the border are blended towards zero.
/// Non-finite grid entries also sample zero.
pub fn grid_sample<S, G>(image: &ArrayBase<S, Ix3>, grid: &ArrayBase<G, Ix3>) -> Result<Array3<f64>>
where
    S: Data<Elem = f64>,
    G: Data<Elem = f64>,
{
    let (channels, height, width) = image.dim();
    let (out_h, out_w, last) = grid.dim();
    if last != 2 {
        return Err(WarpError::Shape(format!(
            "sampling grid must be [H, W, 2], got {:?}",
            grid.shape()
        )));
    }
    if height == 0 || width == 0 {
        return Err(WarpError::Shape(format!(
            "cannot sample an empty image {:?}",
            image.shape()
        )));
    }

    let sx = (width - 1) as f64 / 2.0;
    let sy = (height - 1) as f64 / 2.0;
    let mut out = Array3::zeros((channels, out_h, out_w));
    for oy in 0..out_h {
        for ox in 0..out_w {
            let px = (grid[[oy, ox, 0]] + 1.0) * sx;
            let py = (grid[[oy, ox, 1]] + 1.0) * sy;
            if !px.is_finite() || !py.is_finite() {
                continue;
            }
            let x0 = px.floor();
            let y0 = py.floor();
            let fx = px - x0;
            let fy = py - y0;
            let taps = [
                (x0, y0, (1.0 - fx) * (1.0 - fy)),
                (x0 + 1.0, y0, fx * (1.0 - fy)),
                (x0, y0 + 1.0, (1.0 - fx) * fy),
                (x0 + 1.0, y0 + 1.0, fx * fy),
            ];
            for (tx, ty, weight) in taps {
                if weight == 0.0
                    || tx < 0.0
                    || ty < 0.0
                    || tx > (width - 1) as f64
                    || ty > (height - 1) as f64
                {
                    continue;
                }
                let (ix, iy) = (tx as usize, ty as usize);
                for c in 0..channels {
                    out[[c, oy, ox]] += weight * image[[c, iy, ix]];
                }
            }
        }
    }
    Ok(out)
}

fn check_crop(height: usize, width: usize, crop: usize) -> Result<()> {
    if height < 2 * crop + 1 || width < 2 * crop + 1 {
        return Err(WarpError::InvalidArgument(format!(
            "crop of {crop} leaves nothing of a {height}x{width} image"
        )));
    }
    Ok(())
}

/// Removes `crop` pixels from every side of a `[C, H, W]` image.
pub fn crop_image(image: ArrayView3<'_, f64>, crop: usize) -> Result<Array3<f64>> {
    let (_, height, width) = image.dim();
    check_crop(height, width, crop)?;
    Ok(image
        .slice(s![.., crop..height - crop, crop..width - crop])
        .to_owned())
}

/// Removes `crop` rows and columns from every side of a `[H, W, 2]` grid.
pub fn crop_grid(grid: ArrayView3<'_, f64>, crop: usize) -> Result<Array3<f64>> {
    let (height, width, _) = grid.dim();
    check_crop(height, width, crop)?;
    Ok(grid
        .slice(s![crop..height - crop, crop..width - crop, ..])
        .to_owned())
}
