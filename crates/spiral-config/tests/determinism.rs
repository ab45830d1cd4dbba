// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use rand::Rng;
use spiral_config::determinism::{
    config, configure, lock_reduction_order, rng_from_label, rng_from_optional,
    DeterminismConfig,
};

// The configuration is process-wide, so everything that depends on it lives
// in one test.
#[test]
fn installed_configuration_drives_seeding() {
    let installed = DeterminismConfig {
        enabled: true,
        base_seed: 7,
        fix_reduction: true,
    };
    assert_eq!(configure(installed.clone()), &installed);
    assert_eq!(config(), &installed);
    assert!(lock_reduction_order());

    let draw = |label: &str| {
        let mut rng = rng_from_label(label);
        (0..4).map(|_| rng.gen()).collect::<Vec<u64>>()
    };
    let a = draw("st-tps.warper");
    let b = draw("st-tps.warper");
    assert_eq!(a, b);
    assert_ne!(a, draw("spiral-dve"));

    let unseeded: u64 = rng_from_optional(None, "st-tps.warper").gen();
    assert_eq!(unseeded, a[0]);

    let later = configure(DeterminismConfig::default());
    assert_eq!(later, &installed);
}
