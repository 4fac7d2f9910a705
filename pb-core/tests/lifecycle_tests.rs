/*
 * Integration tests for the GPIO bridge
 *
 * Drive a full Adapter against the simulated chip and the in-memory
 * state tree.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use pb_core::store::{ObjectDescriptor, State, StateCommand, StateStore, ValueType};
use pb_core::{
    Adapter, AdapterConfig, AdapterSignal, MemoryStore, PibridgeError, PortConfig, PortRole,
    Result, SensorDriver, SensorKind, SensorReading, SimDriver, StateValue,
};

// Test utilities

/// Memory store that remembers which paths were actually written and
/// can be told to fail
struct CountingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<String>>,
    objects_fail: AtomicBool,
    failing_publish: Mutex<Option<String>>,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            writes: Mutex::new(Vec::new()),
            objects_fail: AtomicBool::new(false),
            failing_publish: Mutex::new(None),
        }
    }

    /// Every later `ensure_object` fails.
    fn fail_objects(&self) {
        self.objects_fail.store(true, Ordering::SeqCst);
    }

    /// Every later `set_state_if_changed` on `path` fails.
    fn fail_publish(&self, path: &str) {
        *self.failing_publish.lock() = Some(path.to_string());
    }

    fn writes_to(&self, path: &str) -> usize {
        self.writes.lock().iter().filter(|p| *p == path).count()
    }

    async fn value(&self, path: &str) -> Option<StateValue> {
        self.inner.get_state(path).await.unwrap().map(|s| s.val)
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn set_state(&self, path: &str, value: StateValue, ack: bool) -> Result<()> {
        self.writes.lock().push(path.to_string());
        self.inner.set_state(path, value, ack).await
    }

    async fn set_state_if_changed(&self, path: &str, value: StateValue, ack: bool) -> Result<bool> {
        if self.failing_publish.lock().as_deref() == Some(path) {
            return Err(PibridgeError::store(format!("{} unreachable", path)));
        }
        let written = self.inner.set_state_if_changed(path, value, ack).await?;
        if written {
            self.writes.lock().push(path.to_string());
        }
        Ok(written)
    }

    async fn get_state(&self, path: &str) -> Result<Option<State>> {
        self.inner.get_state(path).await
    }

    async fn ensure_object(&self, path: &str, descriptor: ObjectDescriptor) -> Result<()> {
        if self.objects_fail.load(Ordering::SeqCst) {
            return Err(PibridgeError::store("unreachable"));
        }
        self.inner.ensure_object(path, descriptor).await
    }

    async fn delete_object(&self, path: &str, recursive: bool) -> Result<()> {
        self.inner.delete_object(path, recursive).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_objects(prefix).await
    }

    fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<StateCommand>> {
        self.inner.take_commands()
    }
}

/// Sensor returning a settable reading
#[derive(Default)]
struct FakeSensor {
    reading: Mutex<Option<SensorReading>>,
    reads: Mutex<usize>,
}

impl FakeSensor {
    fn with_reading(temperature: f64, humidity: f64) -> Self {
        let sensor = Self::default();
        sensor.set(temperature, humidity);
        sensor
    }

    fn set(&self, temperature: f64, humidity: f64) {
        *self.reading.lock() = Some(SensorReading {
            temperature,
            humidity,
        });
    }

    fn reads(&self) -> usize {
        *self.reads.lock()
    }
}

impl SensorDriver for FakeSensor {
    fn init(&self, _kind: SensorKind, _pin: u32) -> Result<()> {
        Ok(())
    }

    fn read(&self, _kind: SensorKind, pin: u32) -> Result<SensorReading> {
        *self.reads.lock() += 1;
        (*self.reading.lock()).ok_or_else(|| PibridgeError::sensor(pin, "no reading"))
    }
}

fn config(ports: Vec<PortConfig>) -> AdapterConfig {
    AdapterConfig {
        gpio_settings: ports,
        force_init: false,
    }
}

fn adapter(store: &Arc<CountingStore>, sim: &SimDriver, sensor: Arc<FakeSensor>, cfg: AdapterConfig) -> Adapter {
    Adapter::new(store.clone(), cfg, Some(Arc::new(sim.clone())), sensor).with_chip(0)
}

// Inputs

#[tokio::test]
async fn test_pull_up_input_is_inverted() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    sim.set_level(17, true);

    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(17, PortRole::In).with_pull_up(true)]),
    );
    adapter.start().await.unwrap();

    assert_eq!(store.value("gpio.17.state").await, Some(StateValue::Bool(false)));
    assert_eq!(sim.bias(17), Some(pb_core::Bias::PullUp));

    sim.inject_edge(17, false);
    adapter.drain().await;
    assert_eq!(store.value("gpio.17.state").await, Some(StateValue::Bool(true)));
}

#[tokio::test(start_paused = true)]
async fn test_edges_inside_debounce_window_publish_once() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(4, PortRole::In).with_interval(50)]),
    );
    adapter.start().await.unwrap();
    assert_eq!(store.writes_to("gpio.4.state"), 1);

    tokio::time::advance(Duration::from_millis(60)).await;
    sim.inject_edge(4, true);
    adapter.drain().await;
    tokio::time::advance(Duration::from_millis(10)).await;
    sim.inject_edge(4, false);
    adapter.drain().await;

    assert_eq!(store.writes_to("gpio.4.state"), 2);
    assert_eq!(store.value("gpio.4.state").await, Some(StateValue::Bool(true)));

    tokio::time::advance(Duration::from_millis(50)).await;
    sim.inject_edge(4, false);
    adapter.drain().await;
    assert_eq!(store.value("gpio.4.state").await, Some(StateValue::Bool(false)));
}

#[tokio::test]
async fn test_button_publishes_level() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(6, PortRole::Button)]),
    );
    adapter.start().await.unwrap();

    sim.inject_edge(6, true);
    adapter.drain().await;
    assert_eq!(store.value("gpio.6.state").await, Some(StateValue::Bool(true)));
}

// Outputs

#[tokio::test]
async fn test_writes_to_input_roles_never_reach_hardware() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::with_reading(20.0, 50.0)),
        config(vec![
            PortConfig::new(4, PortRole::In),
            PortConfig::new(6, PortRole::Button),
            PortConfig::new(12, PortRole::Dht11).with_interval(2000),
            PortConfig::new(13, PortRole::Dht22).with_interval(2000),
        ]),
    );
    adapter.start().await.unwrap();
    let before = store.value("gpio.4.state").await;

    for pin in [4, 6, 12, 13, 99] {
        adapter
            .control_mut()
            .write_gpio(pin, Some(StateValue::Bool(true)))
            .await
            .unwrap();
    }

    store.inner.command("gpio.6.state", StateValue::Bool(true)).unwrap();
    adapter.drain().await;

    assert!(sim.writes().is_empty());
    assert_eq!(store.value("gpio.4.state").await, before);

    let button = store.get_state("gpio.6.state").await.unwrap().unwrap();
    assert_eq!(button.val, StateValue::Bool(false));
    assert!(button.ack);
}

#[tokio::test]
async fn test_outhigh_restored_after_restart() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let cfg = config(vec![PortConfig::new(5, PortRole::Outhigh)]);
    let mut adapter = adapter(&store, &sim, Arc::new(FakeSensor::default()), cfg.clone());

    adapter.start().await.unwrap();
    assert_eq!(store.value("gpio.5.state").await, Some(StateValue::Bool(true)));
    assert_eq!(sim.level(5), Some(true));

    adapter.stop().await;
    assert!(!sim.is_requested(5));
    store.set_state("gpio.5.state", false.into(), true).await.unwrap();

    adapter.reconfigure(cfg).await.unwrap();
    assert_eq!(store.value("gpio.5.state").await, Some(StateValue::Bool(true)));
    assert_eq!(sim.level(5), Some(true));
}

#[tokio::test]
async fn test_outlow_starts_low() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(8, PortRole::Outlow)]),
    );
    adapter.start().await.unwrap();
    assert_eq!(sim.writes(), vec![(8, false)]);
    assert_eq!(store.value("gpio.8.state").await, Some(StateValue::Bool(false)));
}

#[tokio::test]
async fn test_plain_output_recovers_previous_level() {
    let store = Arc::new(CountingStore::new());
    store.set_state("gpio.9.state", true.into(), true).await.unwrap();

    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(9, PortRole::Out)]),
    );
    adapter.start().await.unwrap();

    assert_eq!(sim.level(9), Some(true));
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn test_external_write_drives_output() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(5, PortRole::Out)]),
    );
    adapter.start().await.unwrap();

    store.inner.command("gpio.5.state", StateValue::from("true")).unwrap();
    adapter.drain().await;
    store.inner.command("gpio.5.state", StateValue::from("0")).unwrap();
    adapter.drain().await;

    assert_eq!(sim.writes(), vec![(5, true), (5, false)]);
    let state = store.get_state("gpio.5.state").await.unwrap().unwrap();
    assert_eq!(state.val, StateValue::Bool(false));
    assert!(state.ack);
}

// Sensors

#[tokio::test(start_paused = true)]
async fn test_sensor_poll_clamped_and_change_only() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let sensor = Arc::new(FakeSensor::with_reading(21.5, 40.0));
    let mut adapter = adapter(
        &store,
        &sim,
        sensor.clone(),
        config(vec![PortConfig::new(12, PortRole::Dht22).with_interval(100)]),
    );
    adapter.start().await.unwrap();
    assert_eq!(adapter.control().sensor_pins(), vec![12]);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let reads = sensor.reads();
    assert!((2..=4).contains(&reads), "expected ~3 reads at 350 ms, got {}", reads);
    assert_eq!(store.writes_to("gpio.12.temperature"), 1);
    assert_eq!(store.value("gpio.12.temperature").await, Some(StateValue::Number(21.5)));

    sensor.set(22.0, 40.0);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.writes_to("gpio.12.temperature"), 2);
    assert_eq!(store.writes_to("gpio.12.humidity"), 1);

    adapter.stop().await;
    // a read already handed to the blocking pool may still land
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reads = sensor.reads();
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(sensor.reads(), reads);
}

// Reconfiguration

#[tokio::test]
async fn test_removed_pin_is_cleaned_up() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(3, PortRole::In), PortConfig::new(5, PortRole::Out)]),
    );
    adapter.start().await.unwrap();
    assert!(!store.list_objects("gpio.3").await.unwrap().is_empty());

    adapter
        .reconfigure(config(vec![PortConfig::new(5, PortRole::Out)]))
        .await
        .unwrap();

    let remaining = store.list_objects("gpio.").await.unwrap();
    assert!(remaining.iter().all(|id| !id.starts_with("gpio.3")));
    assert!(!sim.is_requested(3));
    assert_eq!(adapter.control().bound_pins(), vec![5]);
}

#[tokio::test]
async fn test_force_init_purges_foreign_objects() {
    let store = Arc::new(CountingStore::new());
    store
        .ensure_object(
            "gpio.4.custom",
            ObjectDescriptor::state("custom", "state", ValueType::Mixed, true, true),
        )
        .await
        .unwrap();

    let sim = SimDriver::new();
    let mut cfg = config(vec![PortConfig::new(4, PortRole::In)]);
    cfg.force_init = true;
    let mut adapter = adapter(&store, &sim, Arc::new(FakeSensor::default()), cfg);
    adapter.start().await.unwrap();

    let ids = store.list_objects("gpio.").await.unwrap();
    assert_eq!(ids, vec!["gpio.4", "gpio.4.isInput", "gpio.4.state"]);
}

// Failure handling

#[tokio::test]
async fn test_failed_acquisition_skips_pin() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    sim.break_pin(4);
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(4, PortRole::In), PortConfig::new(5, PortRole::Outhigh)]),
    );
    adapter.start().await.unwrap();

    assert_eq!(adapter.control().bound_pins(), vec![5]);
    assert!(store.inner.object("gpio.4.state").is_some());
}

#[tokio::test]
async fn test_version_mismatch_is_fatal() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    sim.simulate_version_mismatch();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(4, PortRole::In)]),
    );

    let err = adapter.start().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.exit_code(), Some(13));
}

#[tokio::test]
async fn test_store_failure_during_reconfigure_keeps_serving() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let cfg = config(vec![PortConfig::new(4, PortRole::In), PortConfig::new(5, PortRole::Outhigh)]);
    let mut adapter = adapter(&store, &sim, Arc::new(FakeSensor::default()), cfg.clone());
    adapter.start().await.unwrap();

    store.fail_objects();
    let (tx, mut rx) = mpsc::channel(4);
    tx.send(AdapterSignal::Reconfigure(cfg)).await.unwrap();
    let driver = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.inject_edge(4, true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(AdapterSignal::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(adapter.run(&mut rx), driver);
    result.unwrap();

    assert_eq!(adapter.control().bound_pins(), vec![4, 5]);
    assert!(sim.is_requested(5));
    assert_eq!(sim.level(5), Some(true));
    assert_eq!(store.value("gpio.4.state").await, Some(StateValue::Bool(true)));
}

#[tokio::test]
async fn test_failed_publish_does_not_block_other_pins() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(4, PortRole::In), PortConfig::new(17, PortRole::In)]),
    );
    adapter.start().await.unwrap();

    store.fail_publish("gpio.4.state");
    sim.inject_edge(4, true);
    sim.inject_edge(17, true);
    adapter.drain().await;

    assert_eq!(store.value("gpio.4.state").await, Some(StateValue::Bool(false)));
    assert_eq!(store.value("gpio.17.state").await, Some(StateValue::Bool(true)));
}

#[tokio::test]
async fn test_unload_continues_past_failed_release() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    sim.fail_release(6);
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![
            PortConfig::new(5, PortRole::Out),
            PortConfig::new(6, PortRole::Out),
            PortConfig::new(7, PortRole::Out),
        ]),
    );
    adapter.start().await.unwrap();
    assert_eq!(adapter.control().bound_pins(), vec![5, 6, 7]);

    adapter.stop().await;

    assert!(!sim.is_requested(5));
    assert!(sim.is_requested(6));
    assert!(!sim.is_requested(7));
    assert!(adapter.control().bound_pins().is_empty());
}

#[tokio::test]
async fn test_missing_driver_keeps_state_tree() {
    let store = Arc::new(CountingStore::new());
    let mut adapter = Adapter::new(
        store.clone(),
        config(vec![PortConfig::new(4, PortRole::In)]),
        None,
        Arc::new(FakeSensor::default()),
    )
    .with_chip(0);
    adapter.start().await.unwrap();

    assert!(adapter.control().bound_pins().is_empty());
    assert!(store.inner.object("gpio.4.state").is_some());
}

// Event loop

#[tokio::test]
async fn test_run_loop_until_shutdown() {
    let store = Arc::new(CountingStore::new());
    let sim = SimDriver::new();
    let mut adapter = adapter(
        &store,
        &sim,
        Arc::new(FakeSensor::default()),
        config(vec![PortConfig::new(4, PortRole::In), PortConfig::new(5, PortRole::Out)]),
    );
    adapter.start().await.unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let driver = async {
        sim.inject_edge(4, true);
        store.inner.command("gpio.5.state", StateValue::Bool(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(AdapterSignal::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(adapter.run(&mut rx), driver);
    result.unwrap();

    assert_eq!(store.value("gpio.4.state").await, Some(StateValue::Bool(true)));
    assert_eq!(sim.writes(), vec![(5, true)]);
}
