//! hidock-lib: Jensen protocol device core for HiDock USB recorders.

pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod filelist;
pub mod jensen;
pub mod models;
pub mod monitor;
pub mod protocol;
pub mod reconnect;
pub mod reliability;
pub mod response;
pub mod transport;

pub use error::HidockError;
pub use jensen::{DeviceOptions, HealthCheck, JensenDevice, OperationError, OperationMode};
