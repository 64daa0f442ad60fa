//! Core identifier and state types
//!
//! These mirror the vocabulary of a central-manager API: adapter power
//! states, per-peripheral connection states, proximity bands and the
//! identifiers applications use to address simulated peripherals.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a simulated peripheral.
///
/// Stable for the lifetime of the peripheral unless an address rotation
/// is simulated, in which case centrals see a brand new device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(pub Uuid);

impl PeripheralId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeripheralId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Power state of the (single, simulated) Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Bluetooth permission granted to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authorization {
    NotDetermined,
    Restricted,
    Denied,
    AllowedAlways,
}

/// State of one central manager's view of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Distance of a simulated peripheral from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proximity {
    Near,
    Immediate,
    Far,
    OutOfRange,
}

impl Proximity {
    /// Centre of the RSSI band reported for this proximity, in dBm.
    /// Out of range reports 127, the "RSSI unavailable" value.
    pub fn rssi(self) -> i16 {
        match self {
            Proximity::Near => -40,
            Proximity::Immediate => -70,
            Proximity::Far => -100,
            Proximity::OutOfRange => 127,
        }
    }

    pub fn is_in_range(self) -> bool {
        self != Proximity::OutOfRange
    }
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}
