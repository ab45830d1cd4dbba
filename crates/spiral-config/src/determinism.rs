// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Seed derivation for the warp generator and reduction-order locking for the
//! correlation loss.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const ENABLED_VAR: &str = "DVE_DETERMINISTIC";
const SEED_VAR: &str = "DVE_DETERMINISTIC_SEED";
const REDUCTION_VAR: &str = "DVE_DETERMINISTIC_REDUCTION";

/// Process-wide deterministic runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// Whether deterministic execution is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-component seeds.
    pub base_seed: u64,
    /// If true the per-sample loss loop must run sequentially even when the
    /// `parallel` feature of the loss crate is compiled in.
    pub fix_reduction: bool,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: 42,
            fix_reduction: false,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" => Some(true),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" => Some(false),
        _ => None,
    }
}

impl DeterminismConfig {
    /// Builds a configuration snapshot from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var(ENABLED_VAR)
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(defaults.enabled);

        let base_seed = std::env::var(SEED_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.base_seed);

        let fix_reduction = std::env::var(REDUCTION_VAR)
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(enabled);

        Self {
            enabled,
            base_seed,
            fix_reduction,
        }
    }

    /// Derives a deterministic seed for a given component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised deterministic configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs an explicit configuration. Only the first call (or the first
/// [`config`] lookup) wins; later calls return the installed snapshot.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

/// Returns a RNG derived from the provided label. When determinism is disabled
/// this falls back to a random seed from the operating system.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// Returns a RNG seeded from an optional explicit seed, respecting deterministic
/// overrides when the seed is not provided.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}

/// Returns whether batch reductions should be forced to run sequentially.
pub fn lock_reduction_order() -> bool {
    let cfg = config();
    cfg.enabled && cfg.fix_reduction
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
    use std::sync::Mutex;

    fn with_env(vars: &[(&str, Option<&str>)], test: impl FnOnce()) {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        let _lock = GUARD
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let snapshot: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let previous = std::env::var(key).ok();
                match value {
                    Some(val) => std::env::set_var(key, val),
                    None => std::env::remove_var(key),
                }
                ((*key).to_string(), previous)
            })
            .collect();

        let result = catch_unwind(AssertUnwindSafe(test));

        for (key, value) in snapshot {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }

        if let Err(err) = result {
            resume_unwind(err);
        }
    }

    #[test]
    fn defaults_disable_determinism() {
        with_env(
            &[
                (ENABLED_VAR, None),
                (SEED_VAR, None),
                (REDUCTION_VAR, None),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert_eq!(cfg, DeterminismConfig::default());
            },
        );
    }

    #[test]
    fn explicit_values_override_defaults() {
        with_env(
            &[
                (ENABLED_VAR, Some("on")),
                (SEED_VAR, Some("1337")),
                (REDUCTION_VAR, Some("0")),
            ],
            || {
                let cfg = DeterminismConfig::from_env();
                assert!(cfg.enabled);
                assert_eq!(cfg.base_seed, 1337);
                assert!(!cfg.fix_reduction);
            },
        );
    }

    #[test]
    fn reduction_lock_follows_enabled_flag_when_unset() {
        with_env(&[(ENABLED_VAR, Some("1")), (REDUCTION_VAR, None)], || {
            let cfg = DeterminismConfig::from_env();
            assert!(cfg.fix_reduction);
        });
    }

    #[test]
    fn unparsable_flags_fall_back_to_defaults() {
        with_env(&[(ENABLED_VAR, Some("maybe")), (SEED_VAR, Some("x"))], || {
            let cfg = DeterminismConfig::from_env();
            assert!(!cfg.enabled);
            assert_eq!(cfg.base_seed, 42);
        });
    }

    #[test]
    fn derived_seeds_are_stable_per_label() {
        let cfg = DeterminismConfig {
            enabled: true,
            base_seed: 99,
            fix_reduction: true,
        };
        assert_eq!(cfg.seed_for("st-tps/warper"), cfg.seed_for("st-tps/warper"));
        assert_ne!(cfg.seed_for("st-tps/warper"), cfg.seed_for("spiral-dve"));
    }

    #[test]
    fn explicit_seed_wins_over_label() {
        let mut first = rng_from_optional(Some(5), "ignored");
        let mut second = rng_from_optional(Some(5), "also-ignored");
        let a: u64 = first.gen();
        let b: u64 = second.gen();
        assert_eq!(a, b);
    }
}
