//! Board identification
//!
//! The 40-pin header sits on gpiochip0 up to the Raspberry Pi 4 and on the
//! RP1 controller (gpiochip4) from the Pi 5 on.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::constants::{gpio, paths};
use pb_error::{PibridgeError, Result};

/// Board generation from a device-tree model string.
///
/// Zero boards count as generation 1. Anything unrecognised falls back to 1.
pub fn identify_board_model(model: &str) -> u32 {
    if model.contains("Zero") {
        return gpio::DEFAULT_MODEL;
    }
    board_patterns()
        .iter()
        .find_map(|re| re.captures(model)?.get(1)?.as_str().parse().ok())
        .unwrap_or(gpio::DEFAULT_MODEL)
}

/// Model-line patterns, tried in order; group 1 is the generation.
fn board_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?mi)^Raspberry Pi (\d+) Model",
            r"(?mi)^Raspberry Pi Compute Module (\d+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Read the model string, without the trailing NUL the device tree stores.
pub fn read_board_model(path: &Path) -> Result<String> {
    let raw = fs::read(path).map_err(|e| PibridgeError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let text = String::from_utf8_lossy(&raw);
    Ok(text.trim_end_matches('\0').trim().to_string())
}

pub fn chip_index_for_model(model: u32) -> u32 {
    if model >= gpio::RP1_FIRST_MODEL {
        gpio::RP1_CHIP
    } else {
        gpio::DEFAULT_CHIP
    }
}

/// Chip index for the board we are running on.
pub fn resolve_chip_index() -> u32 {
    let model = match read_board_model(Path::new(paths::DEVICE_TREE_MODEL)) {
        Ok(text) => {
            let model = identify_board_model(&text);
            info!(board = %text, model, "Board identified");
            model
        }
        Err(e) => {
            warn!(error = %e, "Cannot read board model, assuming model {}", gpio::DEFAULT_MODEL);
            gpio::DEFAULT_MODEL
        }
    };
    let chip = chip_index_for_model(model);
    debug!(model, chip, "GPIO chip selected");
    chip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_models() {
        assert_eq!(identify_board_model("Raspberry Pi 4 Model B Rev 1.4"), 4);
        assert_eq!(identify_board_model("Raspberry Pi 5 Model B Rev 1.0"), 5);
        assert_eq!(identify_board_model("Raspberry Pi 3 Model B Plus Rev 1.3"), 3);
        assert_eq!(identify_board_model("Raspberry Pi Zero 2 W Rev 1.0"), 1);
        assert_eq!(identify_board_model("Raspberry Pi Model B Rev 2"), 1);
        assert_eq!(identify_board_model("Raspberry Pi Compute Module 5 Rev 1.0"), 5);
        assert_eq!(identify_board_model("Orange Pi 5"), 1);
    }

    #[test]
    fn test_board_patterns_compiled_once() {
        let first = board_patterns();
        assert_eq!(first.len(), 2);
        assert!(std::ptr::eq(first, board_patterns()));
    }

    #[test]
    fn test_chip_selection() {
        assert_eq!(chip_index_for_model(1), 0);
        assert_eq!(chip_index_for_model(4), 0);
        assert_eq!(chip_index_for_model(5), 4);
    }

    #[test]
    fn test_read_model_strips_nul() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        fs::write(&path, b"Raspberry Pi 5 Model B Rev 1.0\0").unwrap();
        assert_eq!(read_board_model(&path).unwrap(), "Raspberry Pi 5 Model B Rev 1.0");
    }

    #[test]
    fn test_read_model_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_board_model(&dir.path().join("nope")).is_err());
    }
}
