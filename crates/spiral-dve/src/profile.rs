// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::time::{Duration, Instant};

use tracing::info;

/// Accumulates wall-clock time per named phase. A disabled profiler never
/// reads the clock.
#[derive(Debug)]
pub(crate) struct Profiler {
    tic: Option<Instant>,
    phases: Vec<(&'static str, Duration)>,
}

impl Profiler {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            tic: enabled.then(Instant::now),
            phases: Vec::new(),
        }
    }

    fn add(&mut self, phase: &'static str, elapsed: Duration) {
        match self.phases.iter_mut().find(|(name, _)| *name == phase) {
            Some((_, total)) => *total += elapsed,
            None => self.phases.push((phase, elapsed)),
        }
    }

    /// Charges the time since the previous lap to `phase`.
    pub(crate) fn lap(&mut self, phase: &'static str) {
        if let Some(tic) = self.tic {
            let now = Instant::now();
            self.add(phase, now - tic);
            self.tic = Some(now);
        }
    }

    /// Moves the lap start to now without charging any phase.
    pub(crate) fn restart(&mut self) {
        if self.tic.is_some() {
            self.tic = Some(Instant::now());
        }
    }

    /// Folds the phases of a per-sample profiler into this one.
    pub(crate) fn absorb(&mut self, other: Profiler) {
        if self.tic.is_none() {
            return;
        }
        for (phase, elapsed) in other.phases {
            self.add(phase, elapsed);
        }
    }

    /// Logs every phase with its share of `total`.
    pub(crate) fn report(&self, label: &str, total: Duration) {
        if self.tic.is_none() {
            return;
        }
        let total_secs = total.as_secs_f64().max(f64::MIN_POSITIVE);
        for (phase, elapsed) in &self.phases {
            let secs = elapsed.as_secs_f64();
            info!(
                target: "spiral_dve::profile",
                label,
                phase,
                secs,
                share = 100.0 * secs / total_secs,
                "phase timing"
            );
        }
        info!(target: "spiral_dve::profile", label, secs = total.as_secs_f64(), "total");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_records_nothing() {
        let mut profiler = Profiler::new(false);
        profiler.lap("softmax");
        assert!(profiler.phases.is_empty());
    }

    #[test]
    fn laps_accumulate_by_phase() {
        let mut profiler = Profiler::new(true);
        profiler.lap("softmax");
        profiler.lap("corr-back");
        profiler.lap("softmax");
        assert_eq!(profiler.phases.len(), 2);

        let mut merged = Profiler::new(true);
        merged.absorb(profiler);
        assert_eq!(merged.phases[0].0, "softmax");
    }
}
