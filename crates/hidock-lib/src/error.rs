//! Unified error type for the hidock-lib crate.
//!
//! [`HidockError`] wraps the module errors (`UsbError`, `ConnectionError`,
//! `TransportError`, `OperationError`) so `?` works across module boundaries.

use std::fmt;

use crate::connection::ConnectionError;
use crate::device::UsbError;
use crate::jensen::OperationError;
use crate::transport::TransportError;

#[derive(Debug)]
pub enum HidockError {
    /// Raw host USB failure (enumeration, listing).
    Usb(UsbError),
    /// Discovery or claim failure.
    Connection(ConnectionError),
    /// Command/response exchange failure.
    Transport(TransportError),
    /// Device operation outcome other than success.
    Operation(OperationError),
    /// Standard I/O error (config persistence, downloads).
    Io(std::io::Error),
    /// Configuration error.
    Config(String),
}

impl fmt::Display for HidockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HidockError::Usb(e) => write!(f, "{e}"),
            HidockError::Connection(e) => write!(f, "{e}"),
            HidockError::Transport(e) => write!(f, "{e}"),
            HidockError::Operation(e) => write!(f, "{e}"),
            HidockError::Io(e) => write!(f, "I/O error: {e}"),
            HidockError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for HidockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HidockError::Usb(e) => Some(e),
            HidockError::Connection(e) => Some(e),
            HidockError::Transport(e) => Some(e),
            HidockError::Operation(e) => Some(e),
            HidockError::Io(e) => Some(e),
            HidockError::Config(_) => None,
        }
    }
}

impl From<UsbError> for HidockError {
    fn from(e: UsbError) -> Self {
        HidockError::Usb(e)
    }
}

impl From<ConnectionError> for HidockError {
    fn from(e: ConnectionError) -> Self {
        HidockError::Connection(e)
    }
}

impl From<TransportError> for HidockError {
    fn from(e: TransportError) -> Self {
        HidockError::Transport(e)
    }
}

impl From<OperationError> for HidockError {
    fn from(e: OperationError) -> Self {
        HidockError::Operation(e)
    }
}

impl From<std::io::Error> for HidockError {
    fn from(e: std::io::Error) -> Self {
        HidockError::Io(e)
    }
}

/// Crate-level Result alias using [`HidockError`].
pub type Result<T> = std::result::Result<T, HidockError>;
