//! Debounce gate for digital inputs and periodic sensor polling

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PortConfig;
use crate::constants::states;
use crate::hw::{SensorDriver, SensorKind};
use crate::paths::state_id;
use crate::store::StateStore;

/// Per-pin time of the last published input level.
///
/// An edge is admitted when no level was published yet or the window has
/// elapsed since the last one; edges inside the window are dropped.
#[derive(Debug, Default)]
pub struct DebounceGate {
    last_publish: HashMap<u32, Instant>,
}

impl DebounceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admits(&self, pin: u32, now: Instant, window: Duration) -> bool {
        match self.last_publish.get(&pin) {
            Some(last) => now.saturating_duration_since(*last) >= window,
            None => true,
        }
    }

    pub fn record(&mut self, pin: u32, now: Instant) {
        self.last_publish.insert(pin, now);
    }

    pub fn clear(&mut self) {
        self.last_publish.clear();
    }
}

/// One repeating read task per temperature/humidity sensor.
pub struct SensorPoller {
    store: Arc<dyn StateStore>,
    sensor: Arc<dyn SensorDriver>,
    tasks: HashMap<u32, JoinHandle<()>>,
}

impl SensorPoller {
    pub fn new(store: Arc<dyn StateStore>, sensor: Arc<dyn SensorDriver>) -> Self {
        Self {
            store,
            sensor,
            tasks: HashMap::new(),
        }
    }

    /// Initialize and start polling every sensor port.
    ///
    /// Ports with polling disabled, or whose sensor cannot be found, are
    /// logged and skipped.
    pub async fn start(&mut self, ports: &[PortConfig]) {
        for port in ports {
            let Some(kind) = SensorKind::from_role(port.role) else {
                continue;
            };
            if self.tasks.contains_key(&port.pin) {
                debug!(pin = port.pin, "Sensor already polled");
                continue;
            }
            let Some(period) = port.poll_interval() else {
                continue;
            };

            let pin = port.pin;
            let sensor = self.sensor.clone();
            match tokio::task::spawn_blocking(move || sensor.init(kind, pin)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(pin, error = %e, "Cannot initialize sensor, skipping");
                    continue;
                }
                Err(e) => {
                    error!(pin, error = %e, "Sensor initialization panicked, skipping");
                    continue;
                }
            }

            let store = self.store.clone();
            let sensor = self.sensor.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    poll_once(store.as_ref(), &sensor, kind, pin).await;
                }
            });
            info!(pin, ?kind, period_ms = period.as_millis() as u64, "Sensor polling started");
            self.tasks.insert(pin, task);
        }
    }

    pub fn active_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.tasks.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Abort every poll task.
    pub fn stop(&mut self) {
        for (pin, task) in self.tasks.drain() {
            task.abort();
            debug!(pin, "Sensor polling stopped");
        }
    }
}

impl Drop for SensorPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_once(store: &dyn StateStore, sensor: &Arc<dyn SensorDriver>, kind: SensorKind, pin: u32) {
    let sensor = sensor.clone();
    let reading = match tokio::task::spawn_blocking(move || sensor.read(kind, pin)).await {
        Ok(Ok(reading)) => reading,
        Ok(Err(e)) => {
            warn!(pin, error = %e, "Sensor read failed");
            return;
        }
        Err(e) => {
            error!(pin, error = %e, "Sensor read panicked");
            return;
        }
    };

    let values = [
        (states::TEMPERATURE, reading.temperature),
        (states::HUMIDITY, reading.humidity),
    ];
    for (suffix, value) in values {
        if let Err(e) = store
            .set_state_if_changed(&state_id(pin, suffix), value.into(), true)
            .await
        {
            error!(pin, state = suffix, error = %e, "Cannot publish sensor value");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRole;
    use crate::hw::sensor::MockSensorDriver;
    use crate::hw::SensorReading;
    use crate::store::MemoryStore;
    use pb_protocol::StateValue;

    #[test]
    fn test_gate_first_edge_admitted() {
        let gate = DebounceGate::new();
        assert!(gate.admits(4, Instant::now(), Duration::from_millis(50)));
    }

    #[test]
    fn test_gate_window() {
        let mut gate = DebounceGate::new();
        let t0 = Instant::now();
        gate.record(4, t0);
        let window = Duration::from_millis(50);
        assert!(!gate.admits(4, t0 + Duration::from_millis(20), window));
        assert!(gate.admits(4, t0 + Duration::from_millis(50), window));
        assert!(gate.admits(5, t0, window));
    }

    #[test]
    fn test_gate_zero_window() {
        let mut gate = DebounceGate::new();
        let t0 = Instant::now();
        gate.record(4, t0);
        assert!(gate.admits(4, t0, Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_publishes_readings() {
        let mut sensor = MockSensorDriver::new();
        sensor.expect_init().returning(|_, _| Ok(()));
        sensor.expect_read().returning(|_, _| {
            Ok(SensorReading {
                temperature: 21.5,
                humidity: 40.0,
            })
        });

        let store = Arc::new(MemoryStore::new());
        let mut poller = SensorPoller::new(store.clone(), Arc::new(sensor));
        poller
            .start(&[PortConfig::new(12, PortRole::Dht22).with_interval(1000)])
            .await;
        assert_eq!(poller.active_pins(), vec![12]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let temp = store.get_state("gpio.12.temperature").await.unwrap().unwrap();
        assert_eq!(temp.val, StateValue::Number(21.5));
        let hum = store.get_state("gpio.12.humidity").await.unwrap().unwrap();
        assert_eq!(hum.val, StateValue::Number(40.0));
        poller.stop();
        assert!(poller.active_pins().is_empty());
    }

    #[tokio::test]
    async fn test_poller_skips_failed_init_and_disabled() {
        let mut sensor = MockSensorDriver::new();
        sensor
            .expect_init()
            .returning(|_, pin| Err(pb_error::PibridgeError::sensor(pin, "missing")));
        sensor.expect_read().never();

        let store = Arc::new(MemoryStore::new());
        let mut poller = SensorPoller::new(store, Arc::new(sensor));
        poller
            .start(&[
                PortConfig::new(12, PortRole::Dht22).with_interval(1000),
                PortConfig::new(13, PortRole::Dht11).with_interval(0),
            ])
            .await;
        assert!(poller.active_pins().is_empty());
    }
}
