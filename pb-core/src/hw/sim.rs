//! Simulated GPIO chip
//!
//! Backs `pibridged --simulate` and the test suite. Clones share one chip,
//! so a test can keep a handle to inject edges and inspect writes while the
//! lifecycle manager owns the driver.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Bias, Line, LineDriver, LineEvent};
use pb_error::{PibridgeError, Result};

#[derive(Debug, Default)]
struct SimPin {
    level: bool,
    requested: bool,
    output: bool,
    bias: Option<Bias>,
    subscriber: Option<mpsc::UnboundedSender<LineEvent>>,
}

#[derive(Debug, Default)]
struct SimChip {
    pins: HashMap<u32, SimPin>,
    writes: Vec<(u32, bool)>,
    broken: HashSet<u32>,
    stuck: HashSet<u32>,
    version_mismatch: bool,
    requests: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimDriver {
    chip: Arc<Mutex<SimChip>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level an input reads without raising an edge.
    pub fn set_level(&self, pin: u32, level: bool) {
        self.chip.lock().pins.entry(pin).or_default().level = level;
    }

    /// Change an input level and notify its listener, if any.
    pub fn inject_edge(&self, pin: u32, level: bool) {
        let mut chip = self.chip.lock();
        let entry = chip.pins.entry(pin).or_default();
        entry.level = level;
        if let Some(tx) = &entry.subscriber {
            let _ = tx.send(LineEvent { pin, value: level });
        }
    }

    /// Current level of a pin, `None` when it was never touched.
    pub fn level(&self, pin: u32) -> Option<bool> {
        self.chip.lock().pins.get(&pin).map(|p| p.level)
    }

    /// Every `write` that reached the chip, in order.
    pub fn writes(&self) -> Vec<(u32, bool)> {
        self.chip.lock().writes.clone()
    }

    pub fn is_requested(&self, pin: u32) -> bool {
        self.chip.lock().pins.get(&pin).is_some_and(|p| p.requested)
    }

    pub fn bias(&self, pin: u32) -> Option<Bias> {
        self.chip.lock().pins.get(&pin).and_then(|p| p.bias)
    }

    /// Number of successful line requests so far
    pub fn request_count(&self) -> usize {
        self.chip.lock().requests
    }

    /// Make every request for `pin` fail.
    pub fn break_pin(&self, pin: u32) {
        self.chip.lock().broken.insert(pin);
    }

    /// Make releasing `pin` fail; the line stays requested.
    pub fn fail_release(&self, pin: u32) {
        self.chip.lock().stuck.insert(pin);
    }

    /// Make every request fail as if the kernel uAPI were incompatible.
    pub fn simulate_version_mismatch(&self) {
        self.chip.lock().version_mismatch = true;
    }

    fn request(&self, pin: u32, output: bool, level: Option<bool>, bias: Option<Bias>) -> Result<Box<dyn Line>> {
        let mut chip = self.chip.lock();
        if chip.version_mismatch {
            return Err(PibridgeError::HardwareVersionMismatch(
                "simulated uAPI mismatch".into(),
            ));
        }
        if chip.broken.contains(&pin) {
            return Err(PibridgeError::hardware(pin, "simulated failure"));
        }

        let entry = chip.pins.entry(pin).or_default();
        if entry.requested {
            return Err(PibridgeError::hardware(pin, "Device or resource busy"));
        }
        entry.requested = true;
        entry.output = output;
        entry.bias = bias;
        entry.subscriber = None;
        if let Some(level) = level {
            entry.level = level;
        }
        chip.requests += 1;

        debug!(pin, output, "Simulated line requested");
        Ok(Box::new(SimLine {
            pin,
            chip: self.chip.clone(),
            held: false,
        }))
    }
}

#[async_trait]
impl LineDriver for SimDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn request_input(&self, _chip: u32, pin: u32, bias: Bias) -> Result<Box<dyn Line>> {
        self.request(pin, false, None, Some(bias))
    }

    async fn request_output(&self, _chip: u32, pin: u32, initial: bool) -> Result<Box<dyn Line>> {
        self.request(pin, true, Some(initial), None)
    }
}

struct SimLine {
    pin: u32,
    chip: Arc<Mutex<SimChip>>,
    /// Set when a release failed, the pin is never freed then
    held: bool,
}

#[async_trait]
impl Line for SimLine {
    fn pin(&self) -> u32 {
        self.pin
    }

    async fn read(&mut self) -> Result<bool> {
        let chip = self.chip.lock();
        chip.pins
            .get(&self.pin)
            .map(|p| p.level)
            .ok_or_else(|| PibridgeError::line_io(self.pin, "line vanished"))
    }

    async fn write(&mut self, value: bool) -> Result<()> {
        let mut chip = self.chip.lock();
        let Some(entry) = chip.pins.get_mut(&self.pin) else {
            return Err(PibridgeError::line_io(self.pin, "line vanished"));
        };
        if !entry.output {
            return Err(PibridgeError::line_io(self.pin, "line is an input"));
        }
        entry.level = value;
        chip.writes.push((self.pin, value));
        Ok(())
    }

    fn subscribe(&mut self, events: mpsc::UnboundedSender<LineEvent>) -> Result<()> {
        let mut chip = self.chip.lock();
        match chip.pins.get_mut(&self.pin) {
            Some(entry) if !entry.output => {
                entry.subscriber = Some(events);
                Ok(())
            }
            _ => Err(PibridgeError::line_io(self.pin, "only inputs report edges")),
        }
    }

    fn release(mut self: Box<Self>) -> Result<()> {
        if self.chip.lock().stuck.contains(&self.pin) {
            self.held = true;
            return Err(PibridgeError::line_io(self.pin, "simulated release failure"));
        }
        drop(self);
        Ok(())
    }
}

impl Drop for SimLine {
    fn drop(&mut self) {
        if self.held {
            return;
        }
        let mut chip = self.chip.lock();
        if let Some(entry) = chip.pins.get_mut(&self.pin) {
            entry.requested = false;
            entry.subscriber = None;
        }
    }
}
