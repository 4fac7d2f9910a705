//! Linux GPIO character device backend (`/dev/gpiochipN`, uAPI v2)

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_gpiod::{Bias as GpiodBias, Chip, Edge, EdgeDetect, Input, Lines, Options, Output};
use tracing::{debug, info, warn};

use super::{Bias, Line, LineDriver, LineEvent};
use crate::constants::{gpio, paths};
use pb_error::{PibridgeError, Result};

/// Gpiod driver using the character device interface.
pub struct GpiodDriver;

impl GpiodDriver {
    pub fn new() -> Self {
        Self
    }

    fn chip_path(chip: u32) -> String {
        format!("{}{}", paths::GPIO_CHIP_PREFIX, chip)
    }

    /// Open the chip once to confirm the driver is usable.
    pub async fn probe(&self, chip: u32) -> Result<()> {
        let _chip = open_chip(chip).await?;
        info!(chip, path = %Self::chip_path(chip), "GPIO chip available");
        Ok(())
    }
}

impl Default for GpiodDriver {
    fn default() -> Self {
        Self::new()
    }
}

async fn open_chip(chip: u32) -> Result<Chip> {
    let path = GpiodDriver::chip_path(chip);
    Chip::new(&path).await.map_err(|e| {
        if is_version_mismatch(&e) {
            PibridgeError::HardwareVersionMismatch(format!("{}: {}", path, e))
        } else {
            PibridgeError::DriverUnavailable(format!("{}: {}", path, e))
        }
    })
}

/// The kernel answers unknown uAPI ioctls with ENOTTY.
fn is_version_mismatch(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTTY)
}

fn request_error(pin: u32, e: io::Error) -> PibridgeError {
    if is_version_mismatch(&e) {
        PibridgeError::HardwareVersionMismatch(format!("GPIO {}: {}", pin, e))
    } else {
        PibridgeError::hardware(pin, e.to_string())
    }
}

fn gpiod_bias(bias: Bias) -> GpiodBias {
    match bias {
        Bias::Disabled => GpiodBias::Disable,
        Bias::PullUp => GpiodBias::PullUp,
        Bias::PullDown => GpiodBias::PullDown,
    }
}

#[async_trait]
impl LineDriver for GpiodDriver {
    fn name(&self) -> &'static str {
        "gpiod"
    }

    async fn request_input(&self, chip: u32, pin: u32, bias: Bias) -> Result<Box<dyn Line>> {
        let chip = open_chip(chip).await?;
        let opts = Options::input([pin])
            .edge(EdgeDetect::Both)
            .bias(gpiod_bias(bias))
            .consumer(gpio::CONSUMER);
        let lines = chip
            .request_lines(opts)
            .await
            .map_err(|e| request_error(pin, e))?;

        let [level] = lines
            .get_values([false])
            .await
            .map_err(|e| PibridgeError::line_io(pin, e.to_string()))?;

        debug!(pin, ?bias, level, "Input line requested");
        Ok(Box::new(GpiodInput {
            pin,
            lines: Some(lines),
            level: Arc::new(AtomicBool::new(level)),
            watcher: None,
        }))
    }

    async fn request_output(&self, chip: u32, pin: u32, initial: bool) -> Result<Box<dyn Line>> {
        let chip = open_chip(chip).await?;
        let opts = Options::output([pin])
            .values([initial])
            .consumer(gpio::CONSUMER);
        let lines = chip
            .request_lines(opts)
            .await
            .map_err(|e| request_error(pin, e))?;

        debug!(pin, initial, "Output line requested");
        Ok(Box::new(GpiodOutput { pin, lines }))
    }
}

/// Input line. Once subscribed, the watcher task owns the request and the
/// level is served from the last reported edge.
struct GpiodInput {
    pin: u32,
    lines: Option<Lines<Input>>,
    level: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

#[async_trait]
impl Line for GpiodInput {
    fn pin(&self) -> u32 {
        self.pin
    }

    async fn read(&mut self) -> Result<bool> {
        match &self.lines {
            Some(lines) => {
                let [level] = lines
                    .get_values([false])
                    .await
                    .map_err(|e| PibridgeError::line_io(self.pin, e.to_string()))?;
                self.level.store(level, Ordering::SeqCst);
                Ok(level)
            }
            None => Ok(self.level.load(Ordering::SeqCst)),
        }
    }

    async fn write(&mut self, _value: bool) -> Result<()> {
        Err(PibridgeError::line_io(self.pin, "line is an input"))
    }

    fn subscribe(&mut self, events: mpsc::UnboundedSender<LineEvent>) -> Result<()> {
        let mut lines = self
            .lines
            .take()
            .ok_or_else(|| PibridgeError::line_io(self.pin, "already subscribed"))?;
        let pin = self.pin;
        let level = self.level.clone();

        self.watcher = Some(tokio::spawn(async move {
            loop {
                match lines.read_event().await {
                    Ok(event) => {
                        let value = matches!(event.edge, Edge::Rising);
                        level.store(value, Ordering::SeqCst);
                        if events.send(LineEvent { pin, value }).is_err() {
                            debug!(pin, "Edge receiver gone, stopping watcher");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(pin, error = %e, "Edge watcher stopped");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(pin = self.pin, "Input line released");
        drop(self);
        Ok(())
    }
}

impl Drop for GpiodInput {
    fn drop(&mut self) {
        // the watcher owns the request once subscribed
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

struct GpiodOutput {
    pin: u32,
    lines: Lines<Output>,
}

#[async_trait]
impl Line for GpiodOutput {
    fn pin(&self) -> u32 {
        self.pin
    }

    async fn read(&mut self) -> Result<bool> {
        let [level] = self
            .lines
            .get_values([false])
            .await
            .map_err(|e| PibridgeError::line_io(self.pin, e.to_string()))?;
        Ok(level)
    }

    async fn write(&mut self, value: bool) -> Result<()> {
        self.lines
            .set_values([value])
            .await
            .map_err(|e| PibridgeError::line_io(self.pin, e.to_string()))
    }

    fn subscribe(&mut self, _events: mpsc::UnboundedSender<LineEvent>) -> Result<()> {
        Err(PibridgeError::line_io(self.pin, "only inputs report edges"))
    }

    fn release(self: Box<Self>) -> Result<()> {
        debug!(pin = self.pin, "Output line released");
        Ok(())
    }
}
