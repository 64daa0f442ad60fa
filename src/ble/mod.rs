//! BLE protocol vocabulary shared by the simulator and its users
//!
//! Identifiers, adapter/connection states, advertisement payloads, the
//! GATT attribute graph, and the errors a simulated link can report.

pub mod advertisement;
pub mod gatt;
pub mod types;

use thiserror::Error;

/// ATT protocol error codes a peripheral may answer a request with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Read not permitted")]
    ReadNotPermitted,

    #[error("Write not permitted")]
    WriteNotPermitted,

    #[error("Insufficient authentication")]
    InsufficientAuthentication,

    #[error("Request not supported")]
    RequestNotSupported,

    #[error("Invalid offset")]
    InvalidOffset,

    #[error("Insufficient authorization")]
    InsufficientAuthorization,

    #[error("Attribute not found")]
    AttributeNotFound,

    #[error("Invalid attribute value length")]
    InvalidAttributeValueLength,

    #[error("Unlikely error")]
    UnlikelyError,

    #[error("Insufficient encryption")]
    InsufficientEncryption,

    #[error("Insufficient resources")]
    InsufficientResources,
}

/// Errors surfaced to applications through [`crate::central::CentralEvent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Peripheral disconnected")]
    PeripheralDisconnected,

    #[error("ATT error: {0}")]
    Att(#[from] AttError),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Attribute is not attached to a parent")]
    NotAttached,

    #[error("Unknown error")]
    Unknown,
}

impl BleError {
    /// Whether the link was lost silently, so the central only notices
    /// once the supervision timeout elapses.
    pub fn is_supervision_timeout(&self) -> bool {
        matches!(self, BleError::ConnectionTimeout)
    }
}
