//! DHT11/DHT22 temperature and humidity sensors
//!
//! Readings come from the kernel `dht11` IIO driver (it handles both
//! variants), enabled per pin with `dtoverlay=dht11,gpiopin=<pin>`. The
//! device shows up under /sys/bus/iio/devices with a name ending in
//! `@<pin in hex>`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::PortRole;
use crate::constants::paths;
use pb_error::{PibridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Dht11,
    Dht22,
}

impl SensorKind {
    pub fn from_role(role: PortRole) -> Option<Self> {
        match role {
            PortRole::Dht11 => Some(SensorKind::Dht11),
            PortRole::Dht22 => Some(SensorKind::Dht22),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

/// Blocking sensor access; callers run it off the event loop.
#[cfg_attr(test, mockall::automock)]
pub trait SensorDriver: Send + Sync {
    /// Locate the sensor for `pin`. Called once before polling starts.
    fn init(&self, kind: SensorKind, pin: u32) -> Result<()>;

    fn read(&self, kind: SensorKind, pin: u32) -> Result<SensorReading>;
}

/// Sensor reader backed by IIO sysfs attributes
pub struct IioDhtSensor {
    base: PathBuf,
    devices: Mutex<HashMap<u32, PathBuf>>,
}

impl IioDhtSensor {
    pub fn new() -> Self {
        Self::with_base(paths::IIO_DEVICES)
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Find the IIO device bound to `pin`.
    fn discover(&self, pin: u32) -> Result<PathBuf> {
        let entries = fs::read_dir(&self.base).map_err(|e| {
            PibridgeError::sensor(pin, format!("cannot list {}: {}", self.base.display(), e))
        })?;

        let suffix = format!("@{:x}", pin);
        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let Ok(name) = fs::read_to_string(dir.join("name")) else {
                continue;
            };
            let name = name.trim();
            if !name.starts_with("dht11") {
                continue;
            }
            debug!(pin, device = %dir.display(), name, "DHT device found");
            if name.ends_with(&suffix) {
                return Ok(dir);
            }
            candidates.push(dir);
        }

        // A single unnamed device is unambiguous
        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }
        Err(PibridgeError::sensor(
            pin,
            "no dht11 IIO device for this pin (is dtoverlay=dht11 enabled?)",
        ))
    }

    fn device(&self, pin: u32) -> Result<PathBuf> {
        if let Some(dir) = self.devices.lock().get(&pin) {
            return Ok(dir.clone());
        }
        let dir = self.discover(pin)?;
        self.devices.lock().insert(pin, dir.clone());
        Ok(dir)
    }
}

impl Default for IioDhtSensor {
    fn default() -> Self {
        Self::new()
    }
}

fn read_milli(pin: u32, path: &Path) -> Result<f64> {
    let content = fs::read_to_string(path)
        .map_err(|e| PibridgeError::sensor(pin, format!("{}: {}", path.display(), e)))?;
    let milli: i64 = content
        .trim()
        .parse()
        .map_err(|_| PibridgeError::sensor(pin, format!("unexpected value {:?}", content.trim())))?;
    Ok((milli as f64 / 100.0).round() / 10.0)
}

impl SensorDriver for IioDhtSensor {
    fn init(&self, kind: SensorKind, pin: u32) -> Result<()> {
        let dir = self.device(pin)?;
        info!(pin, ?kind, device = %dir.display(), "Sensor initialized");
        Ok(())
    }

    fn read(&self, _kind: SensorKind, pin: u32) -> Result<SensorReading> {
        let dir = self.device(pin)?;
        Ok(SensorReading {
            temperature: read_milli(pin, &dir.join("in_temp_input"))?,
            humidity: read_milli(pin, &dir.join("in_humidityrelative_input"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_device(base: &Path, dev: &str, name: &str, temp: &str, hum: &str) {
        let dir = base.join(dev);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join("in_temp_input"), temp).unwrap();
        fs::write(dir.join("in_humidityrelative_input"), hum).unwrap();
    }

    #[test]
    fn test_reads_device_for_pin() {
        let dir = tempfile::tempdir().unwrap();
        fake_device(dir.path(), "iio:device0", "dht11@4", "20000\n", "40000\n");
        fake_device(dir.path(), "iio:device1", "dht11@c", "21450\n", "55120\n");

        let sensor = IioDhtSensor::with_base(dir.path());
        sensor.init(SensorKind::Dht22, 12).unwrap();
        let reading = sensor.read(SensorKind::Dht22, 12).unwrap();
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(reading.humidity, 55.1);
    }

    #[test]
    fn test_single_device_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fake_device(dir.path(), "iio:device0", "dht11", "-5000", "90000");
        let sensor = IioDhtSensor::with_base(dir.path());
        let reading = sensor.read(SensorKind::Dht11, 17).unwrap();
        assert_eq!(reading.temperature, -5.0);
    }

    #[test]
    fn test_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let sensor = IioDhtSensor::with_base(dir.path());
        assert!(matches!(
            sensor.init(SensorKind::Dht11, 4),
            Err(PibridgeError::SensorRead { pin: 4, .. })
        ));
    }

    #[test]
    fn test_read_error_is_sensor_error() {
        let dir = tempfile::tempdir().unwrap();
        fake_device(dir.path(), "iio:device0", "dht11@4", "garbage", "1");
        let sensor = IioDhtSensor::with_base(dir.path());
        assert!(sensor.read(SensorKind::Dht11, 4).is_err());
    }
}
