//! pibridge Core Library
//!
//! Bridges single-board-computer GPIO pins into a home-automation state tree.
//!
//! # Module Structure
//!
//! - `config/` - per-pin configuration, migration of older shapes, persistence
//! - `hw/` - GPIO line drivers, board probing, DHT sensors
//! - `store/` - state store abstraction and the in-memory implementation
//! - `sync` - keeps the `gpio.` object tree in line with the configuration
//! - `lifecycle` - acquires lines, publishes inputs, drives outputs
//! - `scheduler` - debounce gate and sensor polling
//! - `adapter` - one run of the bridge: start, event loop, stop
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pb_core::{Adapter, AdapterConfig, IioDhtSensor, MemoryStore, SimDriver};
//!
//! # async fn demo() -> pb_core::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let mut adapter = Adapter::new(
//!     store,
//!     AdapterConfig::default(),
//!     Some(Arc::new(SimDriver::new())),
//!     Arc::new(IioDhtSensor::new()),
//! );
//! adapter.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod constants;
pub mod hw;
pub mod lifecycle;
pub mod paths;
pub mod scheduler;
pub mod store;
pub mod sync;

pub use adapter::{Adapter, AdapterSignal};
pub use config::{AdapterConfig, PortConfig, PortRole};
pub use hw::{Bias, IioDhtSensor, Line, LineDriver, LineEvent, SensorDriver, SensorKind, SensorReading, SimDriver};
#[cfg(target_os = "linux")]
pub use hw::GpiodDriver;
pub use lifecycle::{Direction, GpioControl};
pub use scheduler::{DebounceGate, SensorPoller};
pub use store::{MemoryStore, ObjectDescriptor, State, StateCommand, StateStore};

pub use pb_error::{PibridgeError, Result};
pub use pb_protocol::StateValue;
