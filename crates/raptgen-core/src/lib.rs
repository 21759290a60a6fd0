//! Shared error type, configuration and compute devices.

pub mod config;
pub mod devices;
pub mod error;

pub use config::{DataPaths, GateConfig, RaptgenConfig, TrainerConfig};
pub use devices::{ComputeDevice, DeviceInventory};
pub use error::{Error, Result};

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
