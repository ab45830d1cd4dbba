// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Random image-pair warping with dense ground-truth correspondence.

use ndarray::{s, stack, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::basis::TpsBasis;
use crate::grid::{
    grid_normalize, grid_unnormalize, keypoints_normalize, spatial_grid_unnormalized,
};
use crate::keypoints::pull_back;
use crate::sample::{crop_grid, crop_image, grid_sample};
use crate::weights::{TpsWeights, WarpNoise};
use crate::{Result, WarpError};

/// Largest tolerated disagreement between the flow field and the
/// resampling grid, in normalised units.
pub const FLOW_CONSISTENCY_TOLERANCE: f64 = 1e-5;

const RNG_LABEL: &str = "st-tps.warper";

/// Parameters of a [`Warper`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarperConfig {
    pub height: usize,
    pub width: usize,
    #[serde(flatten)]
    pub noise: WarpNoise,
    /// Factor applied to every noise magnitude of the first warp.
    pub im1_multiplier: f64,
    /// Pixels removed from every side of the warped outputs. At least 2x2
    /// pixels must remain.
    pub crop: usize,
    /// Control points per axis of the TPS grid.
    pub control_points: usize,
}

impl Default for WarperConfig {
    fn default() -> Self {
        Self {
            height: 100,
            width: 100,
            noise: WarpNoise::default(),
            im1_multiplier: 0.5,
            crop: 15,
            control_points: 10,
        }
    }
}

impl WarperConfig {
    pub fn validate(&self) -> Result<()> {
        self.noise.validate()?;
        if !self.im1_multiplier.is_finite() || self.im1_multiplier < 0.0 {
            return Err(WarpError::InvalidArgument(format!(
                "im1_multiplier must be a non-negative finite number, got {}",
                self.im1_multiplier
            )));
        }
        if self.control_points < 2 {
            return Err(WarpError::InvalidArgument(format!(
                "need at least 2 control points per axis, got {}",
                self.control_points
            )));
        }
        let min = 2 * self.crop + 2;
        if self.height < min || self.width < min {
            return Err(WarpError::InvalidArgument(format!(
                "crop of {} needs an image of at least {min}x{min}, got {}x{}",
                self.crop, self.height, self.width
            )));
        }
        Ok(())
    }

    pub fn cropped_height(&self) -> usize {
        self.height - 2 * self.crop
    }

    pub fn cropped_width(&self) -> usize {
        self.width - 2 * self.crop
    }
}

/// Keypoints of a warped pair, in cropped pixel coordinates.
#[derive(Clone, Debug)]
pub struct PairKeypoints {
    pub first: Array2<f64>,
    pub second: Array2<f64>,
}

/// Output of [`Warper::warp_pair`].
#[derive(Clone, Debug)]
pub struct WarpedPair {
    /// First image after the first warp, `[C, Hc, Wc]`.
    pub image1: Array3<f64>,
    /// Second image after both warps, `[C, Hc, Wc]`.
    pub image2: Array3<f64>,
    /// Pixel offset from every location of `image2` to the location of
    /// `image1` it shows, `[Hc, Wc, 2]`.
    pub flow: Array3<f64>,
    /// Normalised location in `image1` of every pixel of `image2`.
    pub grid: Array3<f64>,
    pub weights1: TpsWeights,
    pub weights2: TpsWeights,
    pub keypoints: Option<PairKeypoints>,
}

impl WarpedPair {
    pub fn height(&self) -> usize {
        self.flow.dim().0
    }

    pub fn width(&self) -> usize {
        self.flow.dim().1
    }

    /// Pixel location in `image1` of every `stride`-th pixel of `image2`,
    /// `[Hc / stride, Wc / stride, 2]`.
    ///
    /// This is the per-sample sampling grid of the correlation loss, whose
    /// lookup targets are `spatial_grid_unnormalized(Hc, Wc)`.
    pub fn correspondence_grid(&self, stride: usize) -> Result<Array3<f64>> {
        let (height, width) = (self.height(), self.width());
        if stride == 0 {
            return Err(WarpError::InvalidArgument("stride must be positive".into()));
        }
        if height % stride != 0 || width % stride != 0 {
            return Err(WarpError::Shape(format!(
                "a {height}x{width} flow cannot be strided by {stride}"
            )));
        }
        let mut grid = spatial_grid_unnormalized(height, width);
        grid += &self.flow;
        Ok(grid.slice(s![..;stride, ..;stride, ..]).to_owned())
    }
}

/// Stacks the correspondence grids of a batch into `[B, h, w, 2]`.
pub fn stack_correspondence_grids(pairs: &[WarpedPair], stride: usize) -> Result<Array4<f64>> {
    if pairs.is_empty() {
        return Err(WarpError::InvalidArgument("cannot stack an empty batch".into()));
    }
    let grids = pairs
        .iter()
        .map(|pair| pair.correspondence_grid(stride))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = grids.iter().map(|g| g.view()).collect();
    stack(Axis(0), &views)
        .map_err(|err| WarpError::Shape(format!("batch grids disagree: {err}")))
}

/// Output of [`Warper::warp_single`].
#[derive(Clone, Debug)]
pub struct WarpedImage {
    /// Warped and cropped image, `[C, Hc, Wc]`.
    pub image: Array3<f64>,
    /// Normalised input location of every uncropped output pixel, `[H, W, 2]`.
    pub grid: Array3<f64>,
    pub weights: TpsWeights,
    pub keypoints: Option<Array2<f64>>,
}

/// Draws random TPS warps for one image resolution.
#[derive(Clone, Debug)]
pub struct Warper {
    config: WarperConfig,
    basis: TpsBasis,
}

impl Warper {
    pub fn new(config: WarperConfig) -> Result<Self> {
        config.validate()?;
        let basis = TpsBasis::new(config.height, config.width, config.control_points)?;
        debug!(
            height = config.height,
            width = config.width,
            crop = config.crop,
            control_points = config.control_points,
            "tps warper ready"
        );
        Ok(Self { config, basis })
    }

    /// RNG for warp sampling. An explicit seed wins; otherwise the process
    /// wide determinism settings decide between a derived seed and entropy.
    pub fn seeded_rng(seed: Option<u64>) -> StdRng {
        spiral_config::determinism::rng_from_optional(seed, RNG_LABEL)
    }

    pub fn config(&self) -> &WarperConfig {
        &self.config
    }

    pub fn basis(&self) -> &TpsBasis {
        &self.basis
    }

    fn check_image(&self, image: &ArrayView3<'_, f64>, label: &str) -> Result<()> {
        let (_, height, width) = image.dim();
        if height != self.config.height || width != self.config.width {
            return Err(WarpError::Shape(format!(
                "{label} is {height}x{width}, warper expects {}x{}",
                self.config.height, self.config.width
            )));
        }
        Ok(())
    }

    fn draw<R: Rng + ?Sized>(
        &self,
        noise: &WarpNoise,
        rng: &mut R,
    ) -> Result<(TpsWeights, Array3<f64>)> {
        let weights = TpsWeights::random(self.basis.num_control_points(), noise, rng);
        let grid = self.basis.sampling_grid(&weights)?;
        if tracing::enabled!(tracing::Level::TRACE) {
            let bending = weights.bending_energy(&self.basis)?;
            trace!(bending, "drew tps warp");
        }
        Ok((weights, grid))
    }

    /// Maps normalised input coordinates to cropped output pixels.
    fn output_pixels(&self, normalized: &Array2<f64>) -> Result<Array2<f64>> {
        let mut pixels = grid_unnormalize(normalized, self.config.height, self.config.width)?;
        pixels -= self.config.crop as f64;
        Ok(pixels)
    }

    /// Warps an image pair.
    ///
    /// Both images go through a first warp whose noise is scaled by
    /// `im1_multiplier`; the second image then goes through an independent
    /// second warp. Both results are center-cropped. `image2` defaults to
    /// `image1` (pass a colour-jittered copy to decorrelate appearance).
    pub fn warp_pair<'a, R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        image1: ArrayView3<'a, f64>,
        image2: Option<ArrayView3<'a, f64>>,
        keypoints: Option<ArrayView2<'_, f64>>,
    ) -> Result<WarpedPair> {
        let _span = tracing::debug_span!("warp_pair").entered();
        let image2 = image2.unwrap_or(image1);
        self.check_image(&image1, "image1")?;
        self.check_image(&image2, "image2")?;
        if image1.dim().0 != image2.dim().0 {
            return Err(WarpError::Shape(format!(
                "image1 has {} channels, image2 has {}",
                image1.dim().0,
                image2.dim().0
            )));
        }

        let cfg = &self.config;
        let (height, width, crop) = (cfg.height, cfg.width, cfg.crop);
        let (out_h, out_w) = (cfg.cropped_height(), cfg.cropped_width());

        let (weights1, grid1) = self.draw(&cfg.noise.scaled(cfg.im1_multiplier), rng)?;
        let warped1 = grid_sample(&image1, &grid1)?;
        let warped2 = grid_sample(&image2, &grid1)?;

        let (weights2, grid2) = self.draw(&cfg.noise, rng)?;
        let warped2 = grid_sample(&warped2, &grid2)?;

        let image1 = crop_image(warped1.view(), crop)?;
        let image2 = crop_image(warped2.view(), crop)?;

        let grid2_pixels = grid_unnormalize(&grid2, height, width)?;
        let offsets = &grid2_pixels - &spatial_grid_unnormalized(height, width);
        let flow = crop_grid(offsets.view(), crop)?;

        let mut source = crop_grid(grid2_pixels.view(), crop)?;
        source -= crop as f64;
        let grid = grid_normalize(&source, out_h, out_w)?;

        let max_error = flow_consistency_error(&flow, &grid)?;
        trace!(max_error, "flow consistency");
        if max_error >= FLOW_CONSISTENCY_TOLERANCE {
            return Err(WarpError::InconsistentFlow { max_error });
        }

        let keypoints = keypoints
            .map(|kp| -> Result<PairKeypoints> {
                let source = keypoints_normalize(&kp, height, width)?;
                let first = pull_back(&self.basis, &weights1, source.view())?;
                let second = pull_back(&self.basis, &weights2, first.view())?;
                Ok(PairKeypoints {
                    first: self.output_pixels(&first)?,
                    second: self.output_pixels(&second)?,
                })
            })
            .transpose()?;

        Ok(WarpedPair {
            image1,
            image2,
            flow,
            grid,
            weights1,
            weights2,
            keypoints,
        })
    }

    /// Warps a single image with the full noise magnitudes and crops it.
    pub fn warp_single<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        image: ArrayView3<'_, f64>,
        keypoints: Option<ArrayView2<'_, f64>>,
    ) -> Result<WarpedImage> {
        let _span = tracing::debug_span!("warp_single").entered();
        self.check_image(&image, "image")?;
        let (weights, grid) = self.draw(&self.config.noise, rng)?;
        let warped = grid_sample(&image, &grid)?;
        let image = crop_image(warped.view(), self.config.crop)?;
        let (height, width) = (self.config.height, self.config.width);
        let keypoints = keypoints
            .map(|kp| -> Result<Array2<f64>> {
                let source = keypoints_normalize(&kp, height, width)?;
                let moved = pull_back(&self.basis, &weights, source.view())?;
                self.output_pixels(&moved)
            })
            .transpose()?;
        Ok(WarpedImage {
            image,
            grid,
            weights,
            keypoints,
        })
    }
}

/// Rebuilds the normalised grid from a cropped flow field.
pub fn reconstruct_grid_from_flow(flow: &Array3<f64>) -> Result<Array3<f64>> {
    let (height, width, _) = flow.dim();
    let pixels = flow + &spatial_grid_unnormalized(height, width);
    grid_normalize(&pixels, height, width)
}

fn flow_consistency_error(flow: &Array3<f64>, grid: &Array3<f64>) -> Result<f64> {
    let rebuilt = reconstruct_grid_from_flow(flow)?;
    let mut max_error = 0.0_f64;
    Zip::from(&rebuilt).and(grid).for_each(|&a, &b| {
        let err = (a - b).abs();
        max_error = if err.is_nan() { f64::INFINITY } else { max_error.max(err) };
    });
    Ok(max_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn small_config() -> WarperConfig {
        WarperConfig {
            height: 24,
            width: 20,
            crop: 3,
            control_points: 5,
            ..WarperConfig::default()
        }
    }

    #[test]
    fn config_rejects_oversized_crop() {
        let mut cfg = WarperConfig {
            height: 20,
            width: 20,
            crop: 9,
            ..WarperConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cropped_height(), 2);

        cfg.crop = 10;
        assert!(matches!(cfg.validate(), Err(WarpError::InvalidArgument(_))));
        cfg.crop = 9;
        cfg.width = 19;
        assert!(matches!(cfg.validate(), Err(WarpError::InvalidArgument(_))));
    }

    #[test]
    fn pair_shapes_follow_crop() {
        let warper = Warper::new(small_config()).unwrap();
        let image = Array3::from_elem((3, 24, 20), 0.5);
        let mut rng = StdRng::seed_from_u64(0);
        let pair = warper.warp_pair(&mut rng, image.view(), None, None).unwrap();
        assert_eq!(pair.image1.dim(), (3, 18, 14));
        assert_eq!(pair.image2.dim(), (3, 18, 14));
        assert_eq!(pair.flow.dim(), (18, 14, 2));
        assert_eq!(pair.grid.dim(), (18, 14, 2));
        assert!(pair.keypoints.is_none());
    }

    #[test]
    fn wrong_resolution_is_a_shape_error() {
        let warper = Warper::new(small_config()).unwrap();
        let image = Array3::zeros((1, 10, 10));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            warper.warp_pair(&mut rng, image.view(), None, None),
            Err(WarpError::Shape(_))
        ));
    }

    #[test]
    fn correspondence_grid_strides_flow() {
        let warper = Warper::new(small_config()).unwrap();
        let image = Array3::zeros((1, 24, 20));
        let mut rng = StdRng::seed_from_u64(4);
        let pair = warper.warp_pair(&mut rng, image.view(), None, None).unwrap();
        let grid = pair.correspondence_grid(2).unwrap();
        assert_eq!(grid.dim(), (9, 7, 2));
        assert!((grid[[1, 2, 0]] - (4.0 + pair.flow[[2, 4, 0]])).abs() < 1e-12);
        assert!((grid[[1, 2, 1]] - (2.0 + pair.flow[[2, 4, 1]])).abs() < 1e-12);
        assert!(matches!(pair.correspondence_grid(4), Err(WarpError::Shape(_))));
        assert!(pair.correspondence_grid(0).is_err());
    }

    #[test]
    fn single_warp_carries_keypoints() {
        let warper = Warper::new(small_config()).unwrap();
        let image = Array3::zeros((1, 24, 20));
        let kp = ndarray::array![[10.0, 12.0]];
        let mut rng = StdRng::seed_from_u64(8);
        let out = warper
            .warp_single(&mut rng, image.view(), Some(kp.view()))
            .unwrap();
        assert_eq!(out.image.dim(), (1, 18, 14));
        let moved = out.keypoints.unwrap();
        assert_eq!(moved.dim(), (1, 2));
        assert!((moved[[0, 0]] - 7.0).abs() < 5.0);
    }
}
