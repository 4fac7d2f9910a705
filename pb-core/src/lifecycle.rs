//! GPIO port lifecycle
//!
//! Owns every requested line. Inputs are read once on setup and then follow
//! edge events through the debounce gate; outputs are driven from external
//! writes and from their role's start level. All mutation happens on the
//! caller's task, so no locking guards the tables.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{PortConfig, PortRole};
use crate::constants::{gpio, states};
use crate::hw::{resolve_chip_index, Bias, Line, LineDriver, LineEvent, SensorDriver};
use crate::paths::{parse_path, state_id};
use crate::scheduler::{DebounceGate, SensorPoller};
use crate::store::{StateCommand, StateStore};
use pb_error::{PibridgeError, Result};
use pb_protocol::StateValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// A pin with a live line
pub struct LineBinding {
    pub line: Box<dyn Line>,
    pub direction: Direction,
}

pub struct GpioControl {
    store: Arc<dyn StateStore>,
    driver: Option<Arc<dyn LineDriver>>,
    chip: Option<u32>,
    settings: HashMap<u32, PortConfig>,
    bindings: HashMap<u32, LineBinding>,
    gate: DebounceGate,
    events_tx: mpsc::UnboundedSender<LineEvent>,
    events_rx: mpsc::UnboundedReceiver<LineEvent>,
    poller: SensorPoller,
}

impl GpioControl {
    /// `driver` is `None` when no GPIO backend could be opened; digital
    /// ports are then skipped while sensors keep working.
    pub fn new(
        store: Arc<dyn StateStore>,
        driver: Option<Arc<dyn LineDriver>>,
        sensor: Arc<dyn SensorDriver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            poller: SensorPoller::new(store.clone(), sensor),
            store,
            driver,
            chip: None,
            settings: HashMap::new(),
            bindings: HashMap::new(),
            gate: DebounceGate::new(),
            events_tx,
            events_rx,
        }
    }

    /// Use a fixed chip index instead of probing the board.
    pub fn with_chip(mut self, chip: u32) -> Self {
        self.chip = Some(chip);
        self
    }

    fn chip_index(&mut self) -> u32 {
        *self.chip.get_or_insert_with(resolve_chip_index)
    }

    pub fn is_bound(&self, pin: u32) -> bool {
        self.bindings.contains_key(&pin)
    }

    pub fn bound_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.bindings.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn direction(&self, pin: u32) -> Option<Direction> {
        self.bindings.get(&pin).map(|b| b.direction)
    }

    pub fn sensor_pins(&self) -> Vec<u32> {
        self.poller.active_pins()
    }

    /// Acquire lines for digital inputs and outputs.
    ///
    /// A pin that cannot be acquired is logged and skipped. Only a driver
    /// incompatible with the kernel aborts setup.
    pub async fn setup(&mut self, inputs: &[PortConfig], outputs: &[PortConfig]) -> Result<()> {
        if inputs.is_empty() && outputs.is_empty() {
            return Ok(());
        }
        for port in inputs.iter().chain(outputs) {
            self.settings.insert(port.pin, port.clone());
        }

        let Some(driver) = self.driver.clone() else {
            error!(
                "GPIO driver not available, {} GPIO port(s) disabled: {}",
                inputs.len() + outputs.len(),
                gpio::DRIVER_REMEDIATION
            );
            return Ok(());
        };
        let chip = self.chip_index();
        info!(driver = driver.name(), chip, inputs = inputs.len(), outputs = outputs.len(), "Setting up GPIO ports");

        for port in inputs {
            let pin = port.pin;
            if self.bindings.contains_key(&pin) {
                debug!(pin, "GPIO already initialized");
                continue;
            }

            let line = match driver.request_input(chip, pin, Bias::from_pull_up(port.pull_up)).await {
                Ok(line) => line,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(pin, error = %e, "Cannot initialize GPIO as input");
                    continue;
                }
            };
            self.bindings.insert(
                pin,
                LineBinding {
                    line,
                    direction: Direction::Input,
                },
            );

            if let Err(e) = self.read_value(pin, None).await {
                error!(pin, error = %e, "Cannot read initial GPIO level");
            }

            let events = self.events_tx.clone();
            if let Some(binding) = self.bindings.get_mut(&pin) {
                if let Err(e) = binding.line.subscribe(events) {
                    error!(pin, error = %e, "Cannot watch GPIO for changes");
                }
            }
            info!(pin, role = %port.role, pull_up = port.pull_up, "GPIO initialized as input");
        }

        for port in outputs {
            let pin = port.pin;
            if self.bindings.contains_key(&pin) {
                debug!(pin, "GPIO already initialized");
                continue;
            }

            let initial = match port.role.initial_value() {
                Some(level) => level,
                None => self.recover_output_level(pin).await,
            };

            let line = match driver.request_output(chip, pin, initial).await {
                Ok(line) => line,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(pin, error = %e, "Cannot initialize GPIO as output");
                    continue;
                }
            };
            self.bindings.insert(
                pin,
                LineBinding {
                    line,
                    direction: Direction::Output,
                },
            );
            info!(pin, role = %port.role, initial, "GPIO initialized as output");

            if port.role.initial_value().is_some() {
                if let Err(e) = self.write_gpio(pin, None).await {
                    error!(pin, error = %e, "Cannot apply start level");
                }
            }
        }

        Ok(())
    }

    /// Last stored level of a plain output, low when there is none.
    async fn recover_output_level(&self, pin: u32) -> bool {
        match self.store.get_state(&state_id(pin, states::STATE)).await {
            Ok(Some(state)) => {
                let level = state.val.as_bool();
                debug!(pin, level, "Restoring previous output level");
                level
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pin, error = %e, "Cannot read previous output level, starting low");
                false
            }
        }
    }

    /// Start polling temperature/humidity sensors.
    pub async fn setup_sensors(&mut self, ports: &[PortConfig]) {
        if ports.is_empty() {
            return;
        }
        for port in ports {
            self.settings.insert(port.pin, port.clone());
        }
        self.poller.start(ports).await;
    }

    /// Publish an input level.
    ///
    /// Without `value` the level is read from the line. Pull-up inputs are
    /// active low, so the published level is inverted.
    pub async fn read_value(&mut self, pin: u32, value: Option<bool>) -> Result<()> {
        let pull_up = self
            .settings
            .get(&pin)
            .map(|p| p.pull_up)
            .ok_or_else(|| PibridgeError::validation(pin, "GPIO is not configured"))?;

        let raw = match value {
            Some(v) => v,
            None => {
                let binding = self
                    .bindings
                    .get_mut(&pin)
                    .ok_or_else(|| PibridgeError::line_io(pin, "GPIO is not initialized"))?;
                binding.line.read().await?
            }
        };

        self.gate.record(pin, Instant::now());
        let level = if pull_up { !raw } else { raw };

        if self
            .store
            .set_state_if_changed(&state_id(pin, states::STATE), level.into(), true)
            .await?
        {
            debug!(pin, raw, level, "GPIO level published");
        }
        Ok(())
    }

    /// Handle an edge from a watched input.
    pub async fn handle_edge(&mut self, event: LineEvent) {
        let pin = event.pin;
        let Some(window) = self.settings.get(&pin).map(PortConfig::debounce_window) else {
            debug!(pin, "Edge on unconfigured GPIO ignored");
            return;
        };

        if !self.gate.admits(pin, Instant::now(), window) {
            debug!(pin, value = event.value, "Edge inside debounce window, discarded");
            return;
        }

        if let Err(e) = self.read_value(pin, Some(event.value)).await {
            error!(pin, error = %e, "Cannot publish GPIO level");
        }
    }

    /// Drive an output and publish the level.
    ///
    /// Writes to disabled, unknown or input pins are rejected with a warning
    /// and never reach the hardware. Without `value` the role's start level
    /// is applied.
    pub async fn write_gpio(&mut self, pin: u32, value: Option<StateValue>) -> Result<()> {
        let role = self.settings.get(&pin).map(|p| p.role).unwrap_or(PortRole::Disabled);
        if role == PortRole::Disabled {
            warn!(pin, "GPIO is not writable, because it is disabled");
            return Ok(());
        }
        if !role.is_output() {
            warn!(pin, role = %role, "GPIO is not writable, because it is configured as input");
            return Ok(());
        }

        let level = match value {
            Some(v) => v.as_bool(),
            None => match role.initial_value() {
                Some(level) => level,
                None => {
                    debug!(pin, "No start level for plain output");
                    return Ok(());
                }
            },
        };

        let binding = self
            .bindings
            .get_mut(&pin)
            .ok_or_else(|| PibridgeError::line_io(pin, "GPIO is not initialized"))?;
        binding.line.write(level).await?;

        self.store
            .set_state(&state_id(pin, states::STATE), level.into(), true)
            .await?;
        debug!(pin, level, "GPIO written");
        Ok(())
    }

    /// Route an external write to the pin it addresses.
    pub async fn handle_command(&mut self, command: StateCommand) {
        match parse_path(&command.path) {
            Some((pin, Some(states::STATE))) => {
                debug!(pin, value = %command.value, "External write");
                if let Err(e) = self.write_gpio(pin, Some(command.value)).await {
                    error!(pin, error = %e, "Cannot write GPIO");
                }
            }
            _ => debug!(path = %command.path, "Write to non-GPIO state ignored"),
        }
    }

    /// Wait for the next edge of any watched input.
    pub async fn next_edge(&mut self) -> Option<LineEvent> {
        self.events_rx.recv().await
    }

    /// Edge already queued, if any
    pub fn try_next_edge(&mut self) -> Option<LineEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Release every line and stop every poller. Never fails; individual
    /// release errors are logged.
    pub async fn unload(&mut self) {
        self.poller.stop();

        let mut released = 0usize;
        for (pin, binding) in self.bindings.drain() {
            match binding.line.release() {
                Ok(()) => released += 1,
                Err(e) => warn!(pin, error = %e, "Cannot release GPIO"),
            }
        }

        // Edges raised before the watchers stopped belong to the old setup
        while self.events_rx.try_recv().is_ok() {}

        self.settings.clear();
        self.gate.clear();
        info!(released, "GPIO ports released");
    }
}
