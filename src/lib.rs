// ble-sim - Deterministic BLE central/peripheral simulation

pub mod ble;
pub mod central;
pub mod config;
pub mod simulation;

pub use ble::advertisement::{AdvertisementConfig, AdvertisementData};
pub use ble::gatt::{
    AttributeGraph, Characteristic, CharacteristicId, CharacteristicProperties,
    CharacteristicSpec, Descriptor, DescriptorId, DescriptorSpec, Service, ServiceId,
    ServiceSpec,
};
pub use ble::types::{
    Authorization, ConnectionState, ManagerState, PeripheralId, Proximity, WriteType,
};
pub use ble::{AttError, BleError};
pub use central::{CentralEvent, CentralManager, EventStream, Peripheral, ScanOptions};
pub use config::{ConfigError, SimulationConfig};
pub use simulation::behavior::{AcceptAll, PeripheralBehavior, SimulatedPeripheral};
pub use simulation::spec::{PeripheralSpec, PeripheralSpecBuilder};
pub use simulation::{ManagerId, Simulation};
