// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{s, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::basis::TpsBasis;
use crate::{Result, WarpError};

/// Standard deviations of the random warp components.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpNoise {
    /// Displacement weight applied to every control point.
    pub warpsd_all: f64,
    /// Larger displacement weight applied to a random half of the entries.
    pub warpsd_subset: f64,
    /// Translation, in normalised units.
    pub transsd: f64,
    /// Relative scale jitter around 1.
    pub scalesd: f64,
    /// Rotation, in degrees.
    pub rotsd: f64,
}

impl Default for WarpNoise {
    fn default() -> Self {
        Self {
            warpsd_all: 0.001,
            warpsd_subset: 0.01,
            transsd: 0.1,
            scalesd: 0.1,
            rotsd: 5.0,
        }
    }
}

impl WarpNoise {
    /// Noise with every magnitude set to zero; yields the identity warp.
    pub fn zero() -> Self {
        Self {
            warpsd_all: 0.0,
            warpsd_subset: 0.0,
            transsd: 0.0,
            scalesd: 0.0,
            rotsd: 0.0,
        }
    }

    /// Multiplies every magnitude by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            warpsd_all: self.warpsd_all * factor,
            warpsd_subset: self.warpsd_subset * factor,
            transsd: self.transsd * factor,
            scalesd: self.scalesd * factor,
            rotsd: self.rotsd * factor,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("warpsd_all", self.warpsd_all),
            ("warpsd_subset", self.warpsd_subset),
            ("transsd", self.transsd),
            ("scalesd", self.scalesd),
            ("rotsd", self.rotsd),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(WarpError::InvalidArgument(format!(
                    "{name} must be a non-negative finite number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// `(nctrl + 3) x 2` weight matrix of one TPS + affine warp.
///
/// Rows `0..nctrl` hold the radial weights of the control points, followed by
/// the translation row and the `x`/`y` coefficient rows of the affine part.
#[derive(Clone, Debug, PartialEq)]
pub struct TpsWeights {
    matrix: Array2<f64>,
}

fn normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.sample::<f64, _>(StandardNormal)
}

impl TpsWeights {
    /// Draws a random warp with `nctrl` control points.
    pub fn random<R: Rng + ?Sized>(nctrl: usize, noise: &WarpNoise, rng: &mut R) -> Self {
        let mut matrix = Array2::zeros((nctrl + 3, 2));
        for value in matrix.slice_mut(s![..nctrl, ..]).iter_mut() {
            let all = normal(rng) * noise.warpsd_all;
            let subset = normal(rng) * noise.warpsd_subset;
            *value = if rng.gen::<f64>() > 0.5 { subset } else { all };
        }

        let rot = (normal(rng) * noise.rotsd).to_radians();
        let sc = 1.0 + normal(rng) * noise.scalesd;
        let tx = normal(rng) * noise.transsd;
        let ty = normal(rng) * noise.transsd;
        let (sin, cos) = rot.sin_cos();

        let mut affine = matrix.slice_mut(s![nctrl.., ..]);
        affine[[0, 0]] = tx;
        affine[[0, 1]] = ty;
        affine[[1, 0]] = sc * cos;
        affine[[1, 1]] = -sc * sin;
        affine[[2, 0]] = sc * sin;
        affine[[2, 1]] = sc * cos;
        Self { matrix }
    }

    /// The warp that maps every point onto itself.
    pub fn identity(nctrl: usize) -> Self {
        let mut matrix = Array2::zeros((nctrl + 3, 2));
        matrix[[nctrl + 1, 0]] = 1.0;
        matrix[[nctrl + 2, 1]] = 1.0;
        Self { matrix }
    }

    pub fn from_matrix(matrix: Array2<f64>) -> Result<Self> {
        if matrix.ncols() != 2 || matrix.nrows() < 3 {
            return Err(WarpError::Shape(format!(
                "tps weights must be (nctrl + 3) x 2, got {:?}",
                matrix.dim()
            )));
        }
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// The `3 x 2` affine block.
    pub fn affine(&self) -> ArrayView2<'_, f64> {
        let nctrl = self.num_control_points();
        self.matrix.slice(s![nctrl.., ..])
    }

    pub fn num_control_points(&self) -> usize {
        self.matrix.nrows() - 3
    }

    /// `trace(Wᵀ K W)` over the radial rows, with `K` the control-point kernel.
    pub fn bending_energy(&self, basis: &TpsBasis) -> Result<f64> {
        let nctrl = self.num_control_points();
        if nctrl != basis.num_control_points() {
            return Err(WarpError::Shape(format!(
                "weights carry {nctrl} control points, basis has {}",
                basis.num_control_points()
            )));
        }
        let w = self.matrix.slice(s![..nctrl, ..]);
        let kw = basis.u_ctrlpts().dot(&w);
        Ok((&w * &kw).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn zero_noise_gives_identity() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = TpsWeights::random(9, &WarpNoise::zero(), &mut rng);
        assert_eq!(weights, TpsWeights::identity(9));
    }

    #[test]
    fn affine_block_is_a_scaled_rotation() {
        let mut rng = StdRng::seed_from_u64(5);
        let weights = TpsWeights::random(4, &WarpNoise::default(), &mut rng);
        let a = weights.affine();
        assert!((a[[1, 0]] - a[[2, 1]]).abs() < 1e-12);
        assert!((a[[1, 1]] + a[[2, 0]]).abs() < 1e-12);
    }

    #[test]
    fn same_seed_same_weights() {
        let noise = WarpNoise::default();
        let a = TpsWeights::random(100, &noise, &mut StdRng::seed_from_u64(1));
        let b = TpsWeights::random(100, &noise, &mut StdRng::seed_from_u64(1));
        let c = TpsWeights::random(100, &noise, &mut StdRng::seed_from_u64(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn scaled_noise_multiplies_every_field() {
        let half = WarpNoise::default().scaled(0.5);
        assert_eq!(half.rotsd, 2.5);
        assert_eq!(half.transsd, 0.05);
    }

    #[test]
    fn negative_noise_is_rejected() {
        let noise = WarpNoise {
            rotsd: -1.0,
            ..WarpNoise::default()
        };
        assert!(matches!(
            noise.validate(),
            Err(WarpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn identity_has_no_bending() {
        let basis = TpsBasis::new(5, 5, 3).unwrap();
        let energy = TpsWeights::identity(9).bending_energy(&basis).unwrap();
        assert_eq!(energy, 0.0);
    }

    #[test]
    fn malformed_matrix_is_rejected() {
        assert!(TpsWeights::from_matrix(Array2::zeros((2, 2))).is_err());
        assert!(TpsWeights::from_matrix(Array2::zeros((5, 3))).is_err());
        let weights = TpsWeights::from_matrix(Array2::zeros((7, 2))).unwrap();
        assert_eq!(weights.num_control_points(), 4);
    }
}
