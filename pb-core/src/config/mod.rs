//! Port configuration: model, migration of older shapes, file persistence

pub mod loader;
pub mod migration;
pub mod types;

pub use loader::{config_path, load_config, save_config, write_atomic};
pub use migration::{normalize, Normalized};
pub use types::{AdapterConfig, PortConfig, PortRole};
