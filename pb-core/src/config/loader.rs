//! Configuration file loading and atomic persistence

use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::migration::{normalize, Normalized};
use crate::constants::paths;
use pb_error::{PibridgeError, Result};

/// Get the configuration file path
///
/// `PIBRIDGE_CONFIG` wins; otherwise /etc/pibridge/config.json for root and
/// ~/.config/pibridge/config.json for everyone else.
pub fn config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(paths::CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let dir = paths::config_dir()
        .ok_or_else(|| PibridgeError::config("Could not determine config directory"))?;
    Ok(dir.join(paths::CONFIG_FILE))
}

/// Load and normalize the configuration at `path`.
///
/// A missing file yields the empty default. A migrated document is written
/// back before returning so the next start sees the canonical shape.
pub fn load_config(path: &Path) -> Result<Normalized> {
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, starting with no GPIOs configured");
        return normalize(Value::Object(Default::default()));
    }

    let content = fs::read_to_string(path).map_err(|e| PibridgeError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let raw: Value = serde_json::from_str(&content).map_err(|e| {
        PibridgeError::config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    let normalized = normalize(raw)?;

    // MIGRATION: persist the canonical shape once
    if normalized.changed {
        match save_config(path, &normalized.raw) {
            Ok(()) => info!(path = %path.display(), "Configuration migrated and saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not save migrated configuration"),
        }
    }

    Ok(normalized)
}

/// Save a configuration document
/// Uses atomic write (temp file + rename) to prevent corruption on crash
pub fn save_config(path: &Path, raw: &Value) -> Result<()> {
    let json = serde_json::to_string_pretty(raw)?;
    write_atomic(path, json.as_bytes())
}

/// Write `bytes` to `path` through a synced temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| PibridgeError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let temp_path = path.with_extension("json.tmp");
    let write_err = |e| PibridgeError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| PibridgeError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!(path = %path.display(), bytes = bytes.len(), "File written");
    Ok(())
}
