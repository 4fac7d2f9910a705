//! Per-pin configuration model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::constants::timing::{MAX_DEBOUNCE_MS, MIN_SENSOR_POLL, MIN_SENSOR_POLL_MS};
use pb_error::PibridgeError;

/// What a pin is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    In,
    Out,
    Outlow,
    Outhigh,
    Button,
    Dht11,
    Dht22,
    #[default]
    Disabled,
}

impl PortRole {
    pub const ALL: [PortRole; 8] = [
        PortRole::In,
        PortRole::Out,
        PortRole::Outlow,
        PortRole::Outhigh,
        PortRole::Button,
        PortRole::Dht11,
        PortRole::Dht22,
        PortRole::Disabled,
    ];

    /// Plain digital in/out
    pub fn is_gpio(self) -> bool {
        matches!(self, PortRole::In | PortRole::Out | PortRole::Outlow | PortRole::Outhigh)
    }

    pub fn is_button(self) -> bool {
        self == PortRole::Button
    }

    /// Temperature/humidity sensor
    pub fn is_temp_hum(self) -> bool {
        matches!(self, PortRole::Dht11 | PortRole::Dht22)
    }

    pub fn is_input(self) -> bool {
        matches!(self, PortRole::In | PortRole::Button) || self.is_temp_hum()
    }

    pub fn is_output(self) -> bool {
        matches!(self, PortRole::Out | PortRole::Outlow | PortRole::Outhigh)
    }

    /// Digital inputs that get a line and an edge listener
    pub fn is_digital_input(self) -> bool {
        matches!(self, PortRole::In | PortRole::Button)
    }

    /// Level an output is driven to on start.
    pub fn initial_value(self) -> Option<bool> {
        match self {
            PortRole::Outhigh => Some(true),
            PortRole::Outlow => Some(false),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortRole::In => "in",
            PortRole::Out => "out",
            PortRole::Outlow => "outlow",
            PortRole::Outhigh => "outhigh",
            PortRole::Button => "button",
            PortRole::Dht11 => "dht11",
            PortRole::Dht22 => "dht22",
            PortRole::Disabled => "disabled",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortRole {
    type Err = PibridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| PibridgeError::InvalidConfig {
                field: "configuration".into(),
                reason: format!("unknown role {:?}", s),
            })
    }
}

/// One configured pin, in the persisted `gpioSettings` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(rename = "gpio")]
    pub pin: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "configuration", default)]
    pub role: PortRole,
    #[serde(rename = "pullUp", default)]
    pub pull_up: bool,
    #[serde(rename = "debounceOrPoll", default)]
    pub debounce_or_poll_ms: u32,
}

impl PortConfig {
    pub fn new(pin: u32, role: PortRole) -> Self {
        Self {
            pin,
            label: None,
            role,
            pull_up: false,
            debounce_or_poll_ms: 0,
        }
    }

    pub fn with_pull_up(mut self, pull_up: bool) -> Self {
        self.pull_up = pull_up;
        self
    }

    pub fn with_interval(mut self, ms: u32) -> Self {
        self.debounce_or_poll_ms = ms;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Display name of the pin's channel
    pub fn display_name(&self) -> String {
        match self.label.as_deref() {
            Some(label) if !label.trim().is_empty() => label.to_string(),
            _ => format!("GPIO {}", self.pin),
        }
    }

    /// Debounce window for digital inputs, capped at 10 s.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_or_poll_ms.min(MAX_DEBOUNCE_MS) as u64)
    }

    /// Poll period for sensors, `None` when polling is disabled.
    ///
    /// Periods below the sensor minimum are raised to it.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.debounce_or_poll_ms {
            0 => {
                warn!(pin = self.pin, "Sensor poll interval is 0, polling disabled");
                None
            }
            ms if ms < MIN_SENSOR_POLL_MS => {
                warn!(
                    pin = self.pin,
                    configured_ms = ms,
                    "Sensor poll interval too short, using {} ms",
                    MIN_SENSOR_POLL_MS
                );
                Some(MIN_SENSOR_POLL)
            }
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }
}

/// Normalized adapter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(rename = "gpioSettings", default)]
    pub gpio_settings: Vec<PortConfig>,
    /// Delete every adapter object on start before re-creating them
    #[serde(rename = "forceinit", default)]
    pub force_init: bool,
}

impl AdapterConfig {
    pub fn port(&self, pin: u32) -> Option<&PortConfig> {
        self.gpio_settings.iter().find(|p| p.pin == pin)
    }

    /// Ports that are not disabled
    pub fn enabled_ports(&self) -> impl Iterator<Item = &PortConfig> {
        self.gpio_settings.iter().filter(|p| p.role != PortRole::Disabled)
    }

    /// Split enabled ports into digital inputs, outputs and sensors.
    pub fn partition(&self) -> (Vec<PortConfig>, Vec<PortConfig>, Vec<PortConfig>) {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut sensors = Vec::new();
        for port in self.enabled_ports() {
            if port.role.is_digital_input() {
                inputs.push(port.clone());
            } else if port.role.is_output() {
                outputs.push(port.clone());
            } else if port.role.is_temp_hum() {
                sensors.push(port.clone());
            }
        }
        (inputs, outputs, sensors)
    }
}
