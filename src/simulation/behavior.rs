//! Peripheral-side behavior of a simulated device
//!
//! The simulation emulates the link and the GATT protocol; what the
//! peripheral actually answers is decided by a [`PeripheralBehavior`].
//! Every method has a permissive default, so a behavior only overrides
//! what a test cares about.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::gatt::{
    AttributeGraph, Characteristic, CharacteristicId, CharacteristicProperties, Descriptor,
    Service,
};
use crate::ble::types::{PeripheralId, Proximity};
use crate::ble::{AttError, BleError};

use super::registry::PeripheralKey;
use super::SimInner;

/// Decides how a simulated peripheral answers central requests.
///
/// Methods are called without any simulation lock held, so they may
/// drive the peripheral through the [`SimulatedPeripheral`] handle passed
/// to [`PeripheralBehavior::on_attach`].
pub trait PeripheralBehavior: Send + Sync {
    /// Called once the peripheral is registered with a simulation.
    fn on_attach(&self, _peripheral: SimulatedPeripheral) {}

    fn on_connect_request(&self) -> Result<(), BleError> {
        Ok(())
    }

    /// A central's link went away. `None` for a deliberate disconnection.
    fn on_disconnect(&self, _error: Option<&BleError>) {}

    fn on_discover_services(&self, _filter: Option<&[Uuid]>) -> Result<(), BleError> {
        Ok(())
    }

    fn on_discover_included_services(
        &self,
        _filter: Option<&[Uuid]>,
        _service: &Service,
    ) -> Result<(), BleError> {
        Ok(())
    }

    fn on_discover_characteristics(
        &self,
        _filter: Option<&[Uuid]>,
        _service: &Service,
    ) -> Result<(), BleError> {
        Ok(())
    }

    fn on_discover_descriptors(&self, _characteristic: &Characteristic) -> Result<(), BleError> {
        Ok(())
    }

    /// Answer a read with the characteristic's current value.
    fn on_read_characteristic(&self, characteristic: &Characteristic) -> Result<Bytes, BleError> {
        if !characteristic
            .properties()
            .contains(CharacteristicProperties::READ)
        {
            return Err(AttError::ReadNotPermitted.into());
        }
        Ok(characteristic.value().cloned().unwrap_or_default())
    }

    fn on_read_descriptor(&self, descriptor: &Descriptor) -> Result<Bytes, BleError> {
        Ok(descriptor.value().cloned().unwrap_or_default())
    }

    fn on_write_characteristic(
        &self,
        _characteristic: &Characteristic,
        _data: &Bytes,
    ) -> Result<(), BleError> {
        Ok(())
    }

    /// A write without response arrived. There is nobody to answer.
    fn on_write_command(&self, _characteristic: &Characteristic, _data: &Bytes) {}

    fn on_write_descriptor(&self, _descriptor: &Descriptor, _data: &Bytes) -> Result<(), BleError> {
        Ok(())
    }

    /// Accept enabling only on characteristics that notify or indicate.
    fn on_set_notify(&self, enabled: bool, characteristic: &Characteristic) -> Result<(), BleError> {
        let capable = characteristic
            .properties()
            .intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE);
        if enabled && !capable {
            return Err(AttError::RequestNotSupported.into());
        }
        Ok(())
    }

    /// A subscription change was confirmed to the central. Value pushes
    /// sent from here on reach it.
    fn on_notify_state_changed(&self, _characteristic: &Characteristic) {}

    fn on_reset(&self) {}
}

/// Behavior that accepts everything with the default answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl PeripheralBehavior for AcceptAll {}

/// Weak control handle on a registered peripheral.
///
/// Stays valid across address rotation. Every call is a no-op once the
/// simulation is dropped or the peripheral removed.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    sim: Weak<SimInner>,
    key: PeripheralKey,
}

impl SimulatedPeripheral {
    pub(crate) fn new(sim: &Arc<SimInner>, key: PeripheralKey) -> Self {
        Self {
            sim: Arc::downgrade(sim),
            key,
        }
    }

    fn target(&self) -> Option<(Arc<SimInner>, PeripheralId)> {
        let sim = self.sim.upgrade()?;
        let id = sim.world().identifier_of(self.key)?;
        Some((sim, id))
    }

    /// Current identifier, `None` once the peripheral is gone.
    pub fn identifier(&self) -> Option<PeripheralId> {
        self.target().map(|(_, id)| id)
    }

    /// Push a new value to every central subscribed to `characteristic`.
    pub fn simulate_value_update(&self, characteristic: CharacteristicId, value: impl Into<Bytes>) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_value_update(id, characteristic, value.into());
        }
    }

    /// See [`crate::Simulation::simulate_name_change`].
    pub fn simulate_name_change(&self, name: Option<String>) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_name_change(id, name);
        }
    }

    /// See [`crate::Simulation::simulate_services_change`].
    pub fn simulate_services_change(&self, change: impl FnOnce(&mut AttributeGraph)) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_services_change(id, change);
        }
    }

    /// See [`crate::Simulation::simulate_disconnection`].
    pub fn simulate_disconnection(&self, error: Option<BleError>) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_disconnection(id, error);
        }
    }

    /// See [`crate::Simulation::simulate_proximity_change`].
    pub fn simulate_proximity_change(&self, proximity: Proximity) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_proximity_change(id, proximity);
        }
    }

    /// See [`crate::Simulation::simulate_reset`].
    pub fn simulate_reset(&self) {
        if let Some((sim, id)) = self.target() {
            sim.simulate_reset(id);
        }
    }
}
