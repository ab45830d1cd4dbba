// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{array, Array3};
use rand::{rngs::StdRng, SeedableRng};
use st_tps::{
    grid_normalize, grid_unnormalize, stack_correspondence_grids, TpsWeights, WarpNoise,
    WarpedPair, Warper, WarperConfig,
};
use std::io::Write;

fn config() -> WarperConfig {
    WarperConfig {
        height: 40,
        width: 36,
        crop: 6,
        ..WarperConfig::default()
    }
}

fn textured_image(channels: usize, height: usize, width: usize) -> Array3<f64> {
    Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
        ((x as f64 * 0.3).sin() + (y as f64 * 0.2).cos()) * (c + 1) as f64
    })
}

fn pair(seed: u64) -> WarpedPair {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(3, 40, 36);
    let mut rng = StdRng::seed_from_u64(seed);
    warper
        .warp_pair(&mut rng, image.view(), None, None)
        .unwrap()
}

#[test]
fn same_seed_reproduces_the_pair() {
    let a = pair(17);
    let b = pair(17);
    assert_eq!(a.image1, b.image1);
    assert_eq!(a.image2, b.image2);
    assert_eq!(a.flow, b.flow);
    assert_eq!(a.weights2, b.weights2);
    assert_ne!(a.weights1, pair(18).weights1);
}

#[test]
fn seeded_rng_is_stable() {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(1, 40, 36);
    let a = warper
        .warp_pair(&mut Warper::seeded_rng(Some(5)), image.view(), None, None)
        .unwrap();
    let b = warper
        .warp_pair(&mut Warper::seeded_rng(Some(5)), image.view(), None, None)
        .unwrap();
    assert_eq!(a.grid, b.grid);
}

#[test]
fn flow_matches_grid_across_many_draws() {
    for seed in 0..25 {
        let pair = pair(seed);
        let (hc, wc) = (pair.height(), pair.width());
        let rebuilt = st_tps::warper::reconstruct_grid_from_flow(&pair.flow).unwrap();
        for (a, b) in rebuilt.iter().zip(pair.grid.iter()) {
            assert!((a - b).abs() < st_tps::FLOW_CONSISTENCY_TOLERANCE);
        }
        assert_eq!((hc, wc), (28, 24));
    }
}

#[test]
fn zero_noise_is_the_identity() {
    let cfg = WarperConfig {
        noise: WarpNoise::zero(),
        ..config()
    };
    let warper = Warper::new(cfg).unwrap();
    let image = textured_image(2, 40, 36);
    let mut rng = StdRng::seed_from_u64(3);
    let pair = warper
        .warp_pair(&mut rng, image.view(), None, None)
        .unwrap();
    let cropped = image.slice(ndarray::s![.., 6..34, 6..30]);
    for ((a, b), c) in pair.image1.iter().zip(pair.image2.iter()).zip(cropped.iter()) {
        assert!((a - c).abs() < 1e-9);
        assert!((b - c).abs() < 1e-9);
    }
    assert!(pair.flow.iter().all(|v| v.abs() < 1e-9));
}

#[test]
fn second_image_defaults_to_the_first() {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(1, 40, 36);
    let a = warper
        .warp_pair(&mut StdRng::seed_from_u64(9), image.view(), None, None)
        .unwrap();
    let b = warper
        .warp_pair(
            &mut StdRng::seed_from_u64(9),
            image.view(),
            Some(image.view()),
            None,
        )
        .unwrap();
    assert_eq!(a.image2, b.image2);
}

#[test]
fn keypoints_follow_both_warps() {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(1, 40, 36);
    let keypoints = array![[18.0, 20.0], [10.5, 14.0], [22.0, 25.5]];
    let mut rng = StdRng::seed_from_u64(42);
    let pair = warper
        .warp_pair(&mut rng, image.view(), None, Some(keypoints.view()))
        .unwrap();
    let moved = pair.keypoints.as_ref().unwrap();
    let basis = warper.basis();

    let mut second = moved.second.clone();
    second += 6.0;
    let second = grid_normalize(&second, 40, 36).unwrap();
    for (row, expected) in second.rows().into_iter().zip(keypoints.rows()) {
        let via2 = basis
            .transform_point(&pair.weights2, [row[0], row[1]])
            .unwrap();
        let via1 = basis.transform_point(&pair.weights1, via2).unwrap();
        let back = grid_unnormalize(&array![[via1[0], via1[1]]], 40, 36).unwrap();
        assert!((back[[0, 0]] - expected[0]).abs() < 1e-6);
        assert!((back[[0, 1]] - expected[1]).abs() < 1e-6);
    }

    // The flow field carries first-image keypoints onto second-image ones
    // wherever the second-image keypoint is still inside the crop.
    let (hc, wc) = (pair.height() as f64, pair.width() as f64);
    let mut checked = 0;
    for (p1, p2) in moved.first.rows().into_iter().zip(moved.second.rows()) {
        let (x, y) = (p2[0].round(), p2[1].round());
        if !(0.0..wc).contains(&x) || !(0.0..hc).contains(&y) {
            continue;
        }
        let (x, y) = (x as usize, y as usize);
        let approx = [x as f64 + pair.flow[[y, x, 0]], y as f64 + pair.flow[[y, x, 1]]];
        assert!((approx[0] - p1[0]).abs() < 1.5);
        assert!((approx[1] - p1[1]).abs() < 1.5);
        checked += 1;
    }
    assert!(checked >= 1);
}

#[test]
fn out_of_frame_keypoints_are_still_reported() {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(1, 40, 36);
    let keypoints = array![[1.0, 1.0], [35.0, 39.0]];
    let pair = warper
        .warp_pair(
            &mut StdRng::seed_from_u64(42),
            image.view(),
            None,
            Some(keypoints.view()),
        )
        .unwrap();
    let moved = pair.keypoints.unwrap();
    assert_eq!(moved.second.dim(), (2, 2));
    assert!(moved.second.iter().all(|v| v.is_finite()));
    assert!(moved.second[[0, 0]] < moved.second[[1, 0]]);
    assert!(moved.second[[0, 1]] < moved.second[[1, 1]]);
}

#[test]
fn first_warp_multiplier_only_scales_the_first_warp() {
    let cfg = WarperConfig {
        im1_multiplier: 0.0,
        ..config()
    };
    let nctrl = cfg.control_points * cfg.control_points;
    let warper = Warper::new(cfg).unwrap();
    let image = textured_image(2, 40, 36);
    let pair = warper
        .warp_pair(&mut StdRng::seed_from_u64(12), image.view(), None, None)
        .unwrap();

    assert_eq!(pair.weights1, TpsWeights::identity(nctrl));
    assert_ne!(pair.weights2, TpsWeights::identity(nctrl));
    let cropped = image.slice(ndarray::s![.., 6..34, 6..30]);
    for (a, c) in pair.image1.iter().zip(cropped.iter()) {
        assert!((a - c).abs() < 1e-9);
    }
    assert!(pair.flow.iter().any(|v| v.abs() > 1e-3));
}

#[test]
fn second_image_may_be_a_separate_copy() {
    let warper = Warper::new(config()).unwrap();
    let image = textured_image(2, 40, 36);
    let pair = {
        let jittered = image.mapv(|v| 0.8 * v + 0.1);
        warper
            .warp_pair(
                &mut StdRng::seed_from_u64(4),
                image.view(),
                Some(jittered.view()),
                None,
            )
            .unwrap()
    };
    let same = warper
        .warp_pair(&mut StdRng::seed_from_u64(4), image.view(), None, None)
        .unwrap();
    assert_eq!(pair.image1, same.image1);
    assert_eq!(pair.flow, same.flow);
    assert_ne!(pair.image2, same.image2);
}

#[test]
fn batch_grids_stack_along_the_first_axis() {
    let pairs: Vec<_> = (0..3).map(pair).collect();
    let stacked = stack_correspondence_grids(&pairs, 2).unwrap();
    assert_eq!(stacked.dim(), (3, 14, 12, 2));
    assert_eq!(
        stacked.index_axis(ndarray::Axis(0), 1),
        pairs[1].correspondence_grid(2).unwrap()
    );
    assert!(stack_correspondence_grids(&[], 2).is_err());
}

#[test]
fn config_loads_from_a_settings_section() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"warper": {{"height": 64, "width": 48, "crop": 4, "rotsd": 2.0}}}}"#
    )
    .unwrap();
    let cfg: WarperConfig = spiral_config::load_section(file.path(), "warper").unwrap();
    assert_eq!(cfg.height, 64);
    assert_eq!(cfg.crop, 4);
    assert_eq!(cfg.noise.rotsd, 2.0);
    assert_eq!(cfg.noise.transsd, 0.1);
    assert_eq!(cfg.im1_multiplier, 0.5);
    assert_eq!(cfg.control_points, 10);
    assert!(Warper::new(cfg).is_ok());
}

#[test]
fn config_serialises_noise_inline() {
    let value = serde_json::to_value(WarperConfig::default()).unwrap();
    assert_eq!(value["crop"], 15);
    assert_eq!(value["rotsd"], 5.0);
    assert!(value.get("noise").is_none());
}
