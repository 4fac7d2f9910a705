//! Configuration normalization
//!
//! Older releases stored per-pin settings in a `gpios` array indexed by pin
//! number with global debounce/pull-up defaults, plus a handful of system
//! metric switches that no longer exist. Everything is folded into the
//! canonical `gpioSettings` list here, once, at load time.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::types::{AdapterConfig, PortConfig, PortRole};
use crate::constants::legacy;
use pb_error::{PibridgeError, Result};

const GPIO_SETTINGS: &str = "gpioSettings";
const FORCE_INIT: &str = "forceinit";

/// Result of [`normalize`]
#[derive(Debug, Clone)]
pub struct Normalized {
    /// Canonical document, ready to be persisted
    pub raw: Value,
    pub config: AdapterConfig,
    /// True when `raw` differs from the input
    pub changed: bool,
}

/// Global defaults that legacy per-pin entries inherit
#[derive(Debug, Clone, Copy, Default)]
struct LegacyDefaults {
    input_debounce_ms: u32,
    input_pull_up: bool,
    button_debounce_ms: u32,
    button_pull_up: bool,
    dht_poll_ms: u32,
}

impl LegacyDefaults {
    fn from_root(root: &Map<String, Value>) -> Self {
        Self {
            input_debounce_ms: root.get(legacy::INPUT_DEBOUNCE_MS).and_then(as_u32).unwrap_or(0),
            input_pull_up: root.get(legacy::INPUT_PULL_UP).and_then(as_bool).unwrap_or(false),
            button_debounce_ms: root.get(legacy::BUTTON_DEBOUNCE_MS).and_then(as_u32).unwrap_or(0),
            button_pull_up: root.get(legacy::BUTTON_PULL_UP).and_then(as_bool).unwrap_or(false),
            dht_poll_ms: root.get(legacy::DHT_POLL_INTERVAL).and_then(as_u32).unwrap_or(0),
        }
    }

    fn apply(&self, port: &mut PortConfig) {
        match port.role {
            PortRole::In => {
                port.pull_up = self.input_pull_up;
                port.debounce_or_poll_ms = self.input_debounce_ms;
            }
            PortRole::Button => {
                port.pull_up = self.button_pull_up;
                port.debounce_or_poll_ms = self.button_debounce_ms;
            }
            PortRole::Dht11 | PortRole::Dht22 => {
                port.debounce_or_poll_ms = self.dht_poll_ms;
            }
            _ => {}
        }
    }
}

/// Fold any historical configuration shape into the canonical one.
///
/// Idempotent: feeding `raw` back in yields the same document with
/// `changed == false`.
pub fn normalize(raw: Value) -> Result<Normalized> {
    let root = match &raw {
        Value::Object(map) => map,
        other => {
            return Err(PibridgeError::config(format!(
                "configuration must be a JSON object, got {}",
                type_name(other)
            )))
        }
    };

    let defaults = LegacyDefaults::from_root(root);

    let mut ports = canonical_ports(root.get(GPIO_SETTINGS));
    let mut seen: HashSet<u32> = ports.iter().map(|p| p.pin).collect();

    for mut port in legacy_ports(root.get(legacy::GPIOS)) {
        if !seen.insert(port.pin) {
            warn!(
                pin = port.pin,
                "GPIO is configured twice, keeping the gpioSettings entry and dropping the legacy one"
            );
            continue;
        }
        defaults.apply(&mut port);
        info!(pin = port.pin, role = %port.role, "Migrated legacy GPIO configuration");
        ports.push(port);
    }

    let force_init = root.get(FORCE_INIT).and_then(as_bool).unwrap_or(false);

    let mut out = root.clone();
    out.remove(legacy::GPIOS);
    for field in legacy::OBSOLETE_FIELDS {
        out.remove(*field);
    }
    out.insert(GPIO_SETTINGS.to_string(), serde_json::to_value(&ports)?);

    let normalized = Value::Object(out);
    let changed = normalized != raw;
    if changed {
        debug!(before = %raw, after = %normalized, "Configuration normalized");
    }

    Ok(Normalized {
        raw: normalized,
        config: AdapterConfig {
            gpio_settings: ports,
            force_init,
        },
        changed,
    })
}

fn canonical_ports(value: Option<&Value>) -> Vec<PortConfig> {
    let entries = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            warn!("gpioSettings is a {}, expected an array; ignoring it", type_name(other));
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut ports = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(port) = parse_port_entry(entry) else {
            continue;
        };
        if !seen.insert(port.pin) {
            warn!(pin = port.pin, "Duplicate gpioSettings entry dropped");
            continue;
        }
        ports.push(port);
    }
    ports
}

fn parse_port_entry(entry: &Value) -> Option<PortConfig> {
    let Some(obj) = entry.as_object() else {
        warn!(entry = %entry, "gpioSettings entry is not an object, dropped");
        return None;
    };
    let Some(pin) = obj.get("gpio").and_then(as_u32) else {
        warn!(entry = %entry, "gpioSettings entry without a valid gpio number, dropped");
        return None;
    };

    let role = match obj.get("configuration").and_then(Value::as_str) {
        Some(s) => s.parse().unwrap_or_else(|e| {
            warn!(pin, error = %e, "Invalid role, GPIO disabled");
            PortRole::Disabled
        }),
        None => PortRole::Disabled,
    };

    Some(PortConfig {
        pin,
        label: obj.get("label").and_then(Value::as_str).map(str::to_string),
        role,
        pull_up: obj.get("pullUp").and_then(as_bool).unwrap_or(false),
        debounce_or_poll_ms: obj.get("debounceOrPoll").and_then(as_u32).unwrap_or(0),
    })
}

/// Enabled entries of the legacy `gpios` list, without global defaults applied
fn legacy_ports(value: Option<&Value>) -> Vec<PortConfig> {
    let indexed: Vec<(u32, &Value)> = match value {
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect(),
        // Some releases persisted the sparse array as an object keyed by pin
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|pin| (pin, v)))
            .collect(),
        _ => return Vec::new(),
    };

    let mut ports = Vec::new();
    for (pin, entry) in indexed {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        if !obj.get("enabled").and_then(as_bool).unwrap_or(false) {
            continue;
        }

        let role = match obj.get("input") {
            Some(Value::Bool(true)) => PortRole::In,
            Some(Value::String(s)) if s == "true" => PortRole::In,
            Some(Value::String(s)) if s != "false" => s.parse().unwrap_or_else(|e| {
                warn!(pin, error = %e, "Invalid legacy role, GPIO disabled");
                PortRole::Disabled
            }),
            _ => PortRole::Out,
        };

        let mut port = PortConfig::new(pin, role);
        port.label = obj.get("label").and_then(Value::as_str).map(str::to_string);
        ports.push(port);
    }
    ports
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
