//! Adapter context
//!
//! Ties configuration, state tree and GPIO lifecycle together for the
//! lifetime of one run: start, event loop, reconfigure, stop.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::AdapterConfig;
use crate::hw::{LineDriver, SensorDriver};
use crate::lifecycle::GpioControl;
use crate::store::{StateCommand, StateStore};
use crate::sync::{purge_all, sync_all};
use pb_error::Result;

/// Requests from the process hosting the adapter
#[derive(Debug)]
pub enum AdapterSignal {
    /// Apply a new configuration: release everything, resync, set up again
    Reconfigure(AdapterConfig),
    Shutdown,
}

pub struct Adapter {
    store: Arc<dyn StateStore>,
    config: AdapterConfig,
    control: GpioControl,
    commands: Option<mpsc::UnboundedReceiver<StateCommand>>,
}

impl Adapter {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: AdapterConfig,
        driver: Option<Arc<dyn LineDriver>>,
        sensor: Arc<dyn SensorDriver>,
    ) -> Self {
        Self {
            control: GpioControl::new(store.clone(), driver, sensor),
            store,
            config,
            commands: None,
        }
    }

    /// Use a fixed chip index instead of probing the board.
    pub fn with_chip(mut self, chip: u32) -> Self {
        self.control = self.control.with_chip(chip);
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn control(&self) -> &GpioControl {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut GpioControl {
        &mut self.control
    }

    /// Sync the state tree and bring every configured port up.
    ///
    /// A state tree that cannot be synced does not keep the hardware down.
    /// Returns an error only for failures that must stop the adapter.
    pub async fn start(&mut self) -> Result<()> {
        if self.config.force_init {
            purge_all(self.store.as_ref()).await;
        }
        if let Err(e) = sync_all(self.store.as_ref(), &self.config).await {
            if e.is_fatal() {
                return Err(e);
            }
            error!(error = %e, "Cannot sync state tree, setting up GPIO ports anyway");
        }

        let (inputs, outputs, sensors) = self.config.partition();
        self.control.setup(&inputs, &outputs).await?;
        self.control.setup_sensors(&sensors).await;

        if self.commands.is_none() {
            self.commands = self.store.take_commands();
        }

        info!(
            ports = self.config.gpio_settings.len(),
            bound = self.control.bound_pins().len(),
            sensors = self.control.sensor_pins().len(),
            "Adapter started"
        );
        Ok(())
    }

    /// Release everything and start again with `config`.
    pub async fn reconfigure(&mut self, config: AdapterConfig) -> Result<()> {
        self.control.unload().await;
        self.config = config;
        self.start().await
    }

    pub async fn stop(&mut self) {
        self.control.unload().await;
        info!("Adapter stopped");
    }

    /// Handle edges and external writes until shutdown is requested or the
    /// signal channel closes. Only fatal errors end the loop early.
    pub async fn run(&mut self, signals: &mut mpsc::Receiver<AdapterSignal>) -> Result<()> {
        loop {
            tokio::select! {
                Some(event) = self.control.next_edge() => {
                    self.control.handle_edge(event).await;
                }
                Some(command) = recv_command(&mut self.commands) => {
                    self.control.handle_command(command).await;
                }
                signal = signals.recv() => match signal {
                    Some(AdapterSignal::Reconfigure(config)) => {
                        info!("Applying new configuration");
                        if let Err(e) = self.reconfigure(config).await {
                            if e.is_fatal() {
                                return Err(e);
                            }
                            error!(error = %e, "Reconfiguration incomplete, continuing");
                        }
                    }
                    Some(AdapterSignal::Shutdown) | None => {
                        debug!("Adapter loop finished");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Process every edge and write that is already queued, then return.
    pub async fn drain(&mut self) {
        loop {
            if let Some(event) = self.control.try_next_edge() {
                self.control.handle_edge(event).await;
                continue;
            }
            let command = self.commands.as_mut().and_then(|rx| rx.try_recv().ok());
            match command {
                Some(command) => self.control.handle_command(command).await,
                None => break,
            }
        }
    }
}

async fn recv_command(
    commands: &mut Option<mpsc::UnboundedReceiver<StateCommand>>,
) -> Option<StateCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
