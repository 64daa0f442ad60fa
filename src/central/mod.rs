//! Application-facing central role
//!
//! A [`CentralManager`] scans for and connects to simulated peripherals;
//! results arrive as [`CentralEvent`]s on its [`EventStream`].

pub mod events;
mod manager;
mod peripheral;

pub use events::{CentralEvent, EventStream};
pub use manager::{CentralManager, ScanOptions};
pub use peripheral::Peripheral;
