//! Model detection maps USB product IDs to HiDock models.
//!
//! Unknown product IDs still connect; they get a generic label carrying the
//! raw ID so logs and bug reports stay useful.

use std::fmt;

use serde::Serialize;

use crate::protocol::*;

/// Known HiDock hardware models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceModel {
    H1,
    H1E,
    P1,
    Unknown(u16),
}

impl DeviceModel {
    /// Detect the model from a USB product ID.
    pub fn from_product_id(product_id: u16) -> Self {
        match product_id {
            PID_H1 | PID_H1_V2 => DeviceModel::H1,
            PID_H1E | PID_H1E_V2 => DeviceModel::H1E,
            PID_P1 | PID_P1_V2 => DeviceModel::P1,
            other => DeviceModel::Unknown(other),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, DeviceModel::Unknown(_))
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::H1 => write!(f, "HiDock H1"),
            DeviceModel::H1E => write!(f, "HiDock H1E"),
            DeviceModel::P1 => write!(f, "HiDock P1"),
            DeviceModel::Unknown(pid) => write!(f, "HiDock Device (0x{pid:04X})"),
        }
    }
}
