//! Hardware access
//!
//! - `LineDriver` / `Line` - one capability for requesting and driving GPIO lines
//! - `gpiod` - Linux GPIO character device backend
//! - `sim` - in-memory backend for tests and `--simulate`
//! - `platform` - board identification and chip selection
//! - `sensor` - DHT11/DHT22 temperature and humidity readers

#[cfg(target_os = "linux")]
pub mod gpiod;
pub mod platform;
pub mod sensor;
pub mod sim;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pb_error::Result;

#[cfg(target_os = "linux")]
pub use gpiod::GpiodDriver;
pub use platform::{chip_index_for_model, identify_board_model, read_board_model, resolve_chip_index};
pub use sensor::{IioDhtSensor, SensorDriver, SensorKind, SensorReading};
pub use sim::SimDriver;

/// Internal pull resistor configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Disabled,
    PullUp,
    PullDown,
}

impl Bias {
    pub fn from_pull_up(pull_up: bool) -> Self {
        if pull_up {
            Bias::PullUp
        } else {
            Bias::Disabled
        }
    }
}

/// Raw level change reported by an input line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    pub pin: u32,
    pub value: bool,
}

/// Opens lines on a GPIO chip.
#[async_trait]
pub trait LineDriver: Send + Sync {
    /// Driver name for diagnostics.
    fn name(&self) -> &'static str;

    /// Request `pin` as an input with edge detection on both edges.
    async fn request_input(&self, chip: u32, pin: u32, bias: Bias) -> Result<Box<dyn Line>>;

    /// Request `pin` as an output driven to `initial`.
    async fn request_output(&self, chip: u32, pin: u32, initial: bool) -> Result<Box<dyn Line>>;
}

/// A requested line. Dropping it without [`Line::release`] also frees it.
#[async_trait]
pub trait Line: Send {
    fn pin(&self) -> u32;

    /// Current raw level.
    async fn read(&mut self) -> Result<bool>;

    /// Drive an output line.
    async fn write(&mut self, value: bool) -> Result<()>;

    /// Start delivering level changes of an input line to `events`.
    fn subscribe(&mut self, events: mpsc::UnboundedSender<LineEvent>) -> Result<()>;

    /// Stop listening and hand the line back to the kernel.
    fn release(self: Box<Self>) -> Result<()>;
}
