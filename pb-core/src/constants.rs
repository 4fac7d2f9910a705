//! Constants and configuration values for pibridge
//!
//! Centralizes paths, limits and the state-tree vocabulary.
//! Add new magic numbers here first instead of inlining them.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Device-tree board model string (NUL terminated)
    pub const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

    /// Industrial I/O devices (kernel dht11 driver exposes DHT11/DHT22 here)
    pub const IIO_DEVICES: &str = "/sys/bus/iio/devices";

    /// Character device prefix for GPIO chips
    pub const GPIO_CHIP_PREFIX: &str = "/dev/gpiochip";

    /// System-wide configuration directory, used when running as root
    pub const CONFIG_DIR: &str = "/etc/pibridge";

    /// Configuration file name
    pub const CONFIG_FILE: &str = "config.json";

    /// Persisted state tree file name
    pub const STORE_FILE: &str = "states.json";

    /// Application directory name under the user config dir
    pub const APP_DIR: &str = "pibridge";

    /// Environment variable overriding the configuration path
    pub const CONFIG_ENV: &str = "PIBRIDGE_CONFIG";

    /// Resolve the directory holding configuration and persisted states.
    ///
    /// Root uses /etc/pibridge; everyone else the XDG config directory.
    pub fn config_dir() -> Option<std::path::PathBuf> {
        // SAFETY: geteuid is always safe - it just returns the effective user ID of the process.
        if unsafe { libc::geteuid() } == 0 {
            return Some(std::path::PathBuf::from(CONFIG_DIR));
        }
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }
}

/// GPIO hardware access
pub mod gpio {
    /// Consumer label attached to every requested line
    pub const CONSUMER: &str = "pibridge";

    /// Chip index on boards older than the Raspberry Pi 5
    pub const DEFAULT_CHIP: u32 = 0;

    /// Chip index carrying the 40-pin header on the Raspberry Pi 5 and later
    pub const RP1_CHIP: u32 = 4;

    /// First board model that uses [`RP1_CHIP`]
    pub const RP1_FIRST_MODEL: u32 = 5;

    /// Model assumed when the board cannot be identified
    pub const DEFAULT_MODEL: u32 = 1;

    /// Remediation shown when the GPIO driver cannot be opened
    pub const DRIVER_REMEDIATION: &str =
        "make sure /dev/gpiochip* exists and is accessible (install libgpiod-dev / add the user to the gpio group)";
}

/// Debounce and poll limits
pub mod timing {
    use super::Duration;

    /// Upper bound for a configured debounce window (ms)
    pub const MAX_DEBOUNCE_MS: u32 = 10_000;

    /// Smallest sensor poll period the DHT family tolerates (ms)
    pub const MIN_SENSOR_POLL_MS: u32 = 350;

    /// [`MIN_SENSOR_POLL_MS`] as a period
    pub const MIN_SENSOR_POLL: Duration = Duration::from_millis(MIN_SENSOR_POLL_MS as u64);
}

/// State tree vocabulary
pub mod states {
    /// Root of every object the adapter owns
    pub const NAMESPACE: &str = pb_protocol::STATE_NAMESPACE;

    pub const STATE: &str = "state";
    pub const IS_INPUT: &str = "isInput";
    pub const TEMPERATURE: &str = "temperature";
    pub const HUMIDITY: &str = "humidity";

    /// Button events that get their own state. Gesture detection is not
    /// implemented, so only the raw level is published.
    pub const BUTTON_EVENTS: &[&str] = &[STATE];

    /// Gesture states written by older releases; removed on every sync
    pub const LEGACY_BUTTON_EVENTS: &[&str] =
        &["pressed", "clicked", "clicked_pressed", "double_clicked", "released"];

    /// Object roles
    pub mod roles {
        pub const CHANNEL: &str = "info";
        pub const INDICATOR: &str = "indicator";
        pub const SWITCH: &str = "switch";
        pub const BUTTON: &str = "button";
        pub const TEMPERATURE: &str = "value.temperature";
        pub const HUMIDITY: &str = "value.humidity";
    }
}

/// Legacy configuration keys
pub mod legacy {
    /// Per-pin array indexed by pin number
    pub const GPIOS: &str = "gpios";

    pub const INPUT_DEBOUNCE_MS: &str = "inputDebounceMs";
    pub const INPUT_PULL_UP: &str = "inputPullUp";
    pub const BUTTON_DEBOUNCE_MS: &str = "buttonDebounceMs";
    pub const BUTTON_PULL_UP: &str = "buttonPullUp";
    pub const DHT_POLL_INTERVAL: &str = "dhtPollInterval";

    /// Top-level fields dropped during normalization
    pub const OBSOLETE_FIELDS: &[&str] = &[
        BUTTON_PULL_UP,
        BUTTON_DEBOUNCE_MS,
        INPUT_PULL_UP,
        INPUT_DEBOUNCE_MS,
        DHT_POLL_INTERVAL,
        "inputPollIntervalMs",
        "cpu",
        "raspberry",
        "memory",
        "network",
        "sdcard",
        "swap",
        "temperature",
        "uptime",
        "wlan",
    ];
}

/// Daemon defaults
pub mod daemon {
    use super::Duration;

    /// Unix socket for state access
    pub const SOCKET_PATH: &str = "/run/pibridge.sock";

    /// PID file
    pub const PID_FILE: &str = "/run/pibridged.pid";

    /// Log level environment variable
    pub const LOG_ENV: &str = "PIBRIDGE_LOG";

    /// How often the persisted state file is flushed while running
    pub const STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
}
