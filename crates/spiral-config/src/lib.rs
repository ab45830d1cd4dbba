// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Runtime configuration shared by the warp generator and the dense
//! correlation loss: deterministic seeding, tracing setup and JSON settings.

pub mod determinism;
pub mod settings;
pub mod tracing;

pub use settings::{load_json, load_section, SettingsError};
pub use self::tracing::{init_tracing, init_tracing_with, TraceSettings};
