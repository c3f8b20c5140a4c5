//! Interlock guards
//!
//! Privileged device operations consult an explicit interlock policy before
//! proceeding. The policy is a plain value queried at the call site; there is
//! no ambient decoration.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Snapshot of the device-side safety gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interlocks {
    /// Flash write interlock
    pub flash: bool,
    /// High-voltage interlock
    pub hv: bool,
    /// Lid-closed interlock
    pub lid: bool,
    /// FPGA configuration complete
    pub fpga_configured: bool,
}

/// Outcome of an interlock check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// The operation may proceed
    Allowed,
    /// The operation is blocked, with the gate that blocked it
    Denied(String),
}

impl Guard {
    /// Whether the operation may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Guard::Allowed)
    }

    /// Convert a denial into a typed error
    pub fn require(self) -> Result<(), ProtocolError> {
        match self {
            Guard::Allowed => Ok(()),
            Guard::Denied(reason) => Err(ProtocolError::InterlockDenied(reason)),
        }
    }
}

impl Interlocks {
    fn gate(enabled: bool, name: &str) -> Guard {
        if enabled {
            Guard::Allowed
        } else {
            Guard::Denied(format!("{name} interlock not enabled"))
        }
    }

    /// Flash operations allowed?
    pub fn flash_ok(&self) -> Guard {
        Self::gate(self.flash, "flash")
    }

    /// High-voltage operations allowed?
    pub fn hv_ok(&self) -> Guard {
        Self::gate(self.hv, "HV")
    }

    /// Lid-sensitive operations allowed?
    pub fn lid_ok(&self) -> Guard {
        Self::gate(self.lid, "lid")
    }

    /// FPGA-dependent operations allowed?
    pub fn fpga_ok(&self) -> Guard {
        if self.fpga_configured {
            Guard::Allowed
        } else {
            Guard::Denied("FPGA not configured".to_string())
        }
    }
}
