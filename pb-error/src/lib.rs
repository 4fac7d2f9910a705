//! Unified error handling for pibridge
//!
//! One error type shared by the configuration layer, the GPIO lifecycle,
//! the state store and the daemon. Per-pin failures are recovered by the
//! caller; only [`PibridgeError::is_fatal`] errors terminate the adapter.

use std::io;
use std::path::PathBuf;

/// Result type alias using PibridgeError
pub type Result<T> = std::result::Result<T, PibridgeError>;

/// Process exit code used when the GPIO driver is incompatible with the kernel.
pub const VERSION_MISMATCH_EXIT_CODE: i32 = 13;

/// Unified error type for all pibridge operations
#[derive(thiserror::Error, Debug)]
pub enum PibridgeError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Hardware Errors
    // ============================================================================
    #[error("Cannot acquire GPIO {pin}: {reason}")]
    HardwareAcquisition {
        pin: u32,
        reason: String,
    },

    #[error("GPIO driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("GPIO driver does not match the running kernel: {0}")]
    HardwareVersionMismatch(String),

    #[error("I/O on GPIO {pin} failed: {reason}")]
    LineIo {
        pin: u32,
        reason: String,
    },

    #[error("Sensor on GPIO {pin} failed: {reason}")]
    SensorRead {
        pin: u32,
        reason: String,
    },

    // ============================================================================
    // State Store Errors
    // ============================================================================
    #[error("State store error: {0}")]
    Store(String),

    #[error("Unknown state path: {0}")]
    UnknownPath(String),

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("GPIO {pin} rejected: {reason}")]
    Validation {
        pin: u32,
        reason: String,
    },
}

impl PibridgeError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error from a string
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a line acquisition error for a pin
    pub fn hardware(pin: u32, reason: impl Into<String>) -> Self {
        Self::HardwareAcquisition {
            pin,
            reason: reason.into(),
        }
    }

    /// Create a line read/write error for a pin
    pub fn line_io(pin: u32, reason: impl Into<String>) -> Self {
        Self::LineIo {
            pin,
            reason: reason.into(),
        }
    }

    pub fn sensor(pin: u32, reason: impl Into<String>) -> Self {
        Self::SensorRead {
            pin,
            reason: reason.into(),
        }
    }

    pub fn validation(pin: u32, reason: impl Into<String>) -> Self {
        Self::Validation {
            pin,
            reason: reason.into(),
        }
    }

    /// Errors that must stop the adapter instead of being recovered per pin.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HardwareVersionMismatch(_))
    }

    /// Process exit code for a fatal error, `None` for recoverable ones.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::HardwareVersionMismatch(_) => Some(VERSION_MISMATCH_EXIT_CODE),
            _ => None,
        }
    }
}
