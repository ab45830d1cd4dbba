// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Names a file that receives a Chrome trace of the loss/warp spans.
pub const CHROME_TRACE_VAR: &str = "DVE_TRACE_CHROME";

const DEFAULT_FILTER: &str = "info";

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// The `tracing` section of an experiment settings file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    /// Chrome trace destination. [`CHROME_TRACE_VAR`] takes precedence.
    pub chrome_trace: Option<PathBuf>,
}

impl TraceSettings {
    fn env_filter(&self) -> Result<EnvFilter, InitError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directives = self.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        Ok(EnvFilter::try_new(directives)?)
    }

    fn chrome_trace_path(&self) -> Result<Option<PathBuf>, InitError> {
        match std::env::var(CHROME_TRACE_VAR) {
            Ok(raw) if !raw.trim().is_empty() => Ok(Some(PathBuf::from(raw.trim()))),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(self.chrome_trace.clone()),
            Err(err) => Err(InitError::Env(err)),
        }
    }
}

/// Installs the global subscriber with default settings.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with(&TraceSettings::default())
}

/// Installs the global subscriber: a fmt layer filtered by `RUST_LOG` (or
/// `settings.filter`, default `info`) plus, when a trace path is known, a
/// Chrome layer recording every span. The loss profiler and the warp spans
/// show up there with their phase fields.
pub fn init_tracing_with(settings: &TraceSettings) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = settings.env_filter()?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());

    let mut guard = None;
    let chrome_layer = settings.chrome_trace_path()?.map(|path| {
        let (layer, flush) = tracing_chrome::ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();
        guard = Some(flush);
        layer
    });

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(chrome_layer)
        .try_init()?;

    if guard.is_some() {
        let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
        if let Ok(mut slot) = cell.lock() {
            *slot = guard;
        }
    }
    Ok(())
}

/// Flushes and drops the Chrome trace writer, if one was installed.
pub fn flush_chrome_trace() {
    if let Some(cell) = CHROME_GUARD.get() {
        if let Ok(mut slot) = cell.lock() {
            if let Some(guard) = slot.take() {
                guard.flush();
            }
        }
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read {CHROME_TRACE_VAR}: {0}")]
    Env(std::env::VarError),
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("another global subscriber is installed: {0}")]
    Install(#[from] TryInitError),
}
