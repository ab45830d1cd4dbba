// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! JSON settings loading shared by the warp generator and the loss.
//!
//! Experiment files keep one object per component, e.g.
//!
//! ```json
//! { "warper": { "height": 100, "width": 100, "crop": 15 },
//!   "loss": { "stride": 2, "norm": true } }
//! ```
//!
//! [`load_section`] pulls a single component out of such a file so that each
//! crate can own its configuration type.

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors surfaced while reading experiment settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("settings section `{0}` is missing")]
    MissingSection(String),
}

/// Parses a settings value from a JSON string.
pub fn from_json_str<T: DeserializeOwned>(raw: &str) -> Result<T, SettingsError> {
    Ok(serde_json::from_str(raw)?)
}

/// Reads and parses a JSON settings file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, SettingsError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_json_str(&raw)
}

/// Reads a JSON file and deserialises the object stored under `section`.
pub fn load_section<T: DeserializeOwned>(
    path: impl AsRef<Path>,
    section: &str,
) -> Result<T, SettingsError> {
    let mut root: serde_json::Value = load_json(path)?;
    let value = root
        .get_mut(section)
        .map(serde_json::Value::take)
        .ok_or_else(|| SettingsError::MissingSection(section.to_string()))?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Loss {
        stride: usize,
        #[serde(default)]
        norm: bool,
    }

    #[test]
    fn loads_named_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"loss": {{"stride": 2, "norm": true}}, "warper": {{}}}}"#).unwrap();
        let loss: Loss = load_section(file.path(), "loss").unwrap();
        assert_eq!(
            loss,
            Loss {
                stride: 2,
                norm: true
            }
        );
    }

    #[test]
    fn missing_section_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"warper": {{}}}}"#).unwrap();
        let err = load_section::<Loss>(file.path(), "loss").unwrap_err();
        assert!(matches!(err, SettingsError::MissingSection(name) if name == "loss"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_json::<Loss>("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, SettingsError::Io { .. }));
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let loss: Loss = from_json_str(r#"{"stride": 1}"#).unwrap();
        assert!(!loss.norm);
    }
}
