//! A central manager's handle on one peripheral
//!
//! Every request is asynchronous: the call returns immediately and the
//! outcome arrives later on the manager's [`super::EventStream`]. Requests
//! made while the adapter is off or the peripheral isn't connected are
//! dropped with a warning and produce no event at all.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::gatt::{AttributeGraph, CharacteristicId, DescriptorId, ServiceId};
use crate::ble::types::{ConnectionState, PeripheralId, WriteType};
use crate::simulation::registry::{ManagerId, ManagerToken, Projection};
use crate::simulation::Simulation;

/// Largest value a write with response may carry.
const MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

#[derive(Clone)]
pub struct Peripheral {
    sim: Simulation,
    manager: ManagerId,
    _token: Arc<ManagerToken>,
    id: PeripheralId,
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.id)
            .field("manager", &self.manager)
            .finish()
    }
}

impl Peripheral {
    pub(crate) fn new(
        sim: Simulation,
        manager: ManagerId,
        token: Arc<ManagerToken>,
        id: PeripheralId,
    ) -> Self {
        Self {
            sim,
            manager,
            _token: token,
            id,
        }
    }

    fn with_projection<T>(&self, f: impl FnOnce(&Projection) -> T) -> Option<T> {
        let world = self.sim.inner().world();
        world.manager(self.manager)?.projections.get(&self.id).map(f)
    }

    /// Stable identifier of the peripheral, as seen by every manager.
    pub fn id(&self) -> PeripheralId {
        self.id
    }

    /// Last known name: advertised, or read from the device once connected.
    pub fn name(&self) -> Option<String> {
        self.with_projection(|p| p.name.clone()).flatten()
    }

    /// `Disconnected` also once this manager forgot the peripheral.
    pub fn state(&self) -> ConnectionState {
        self.with_projection(|p| p.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Snapshot of everything discovered so far.
    pub fn attributes(&self) -> AttributeGraph {
        self.with_projection(|p| p.attributes.clone())
            .unwrap_or_default()
    }

    /// Discover primary services; `None` discovers all of them.
    pub fn discover_services(&self, services: Option<Vec<Uuid>>) {
        self.sim
            .inner()
            .discover_services(self.manager, self.id, services);
    }

    /// Discover the services included by `service`.
    pub fn discover_included_services(&self, service: ServiceId, filter: Option<Vec<Uuid>>) {
        self.sim
            .inner()
            .discover_included_services(self.manager, self.id, service, filter);
    }

    /// Discover the characteristics of `service`; `None` discovers all of them.
    pub fn discover_characteristics(&self, service: ServiceId, filter: Option<Vec<Uuid>>) {
        self.sim
            .inner()
            .discover_characteristics(self.manager, self.id, service, filter);
    }

    /// Discover every descriptor of `characteristic`.
    pub fn discover_descriptors(&self, characteristic: CharacteristicId) {
        self.sim
            .inner()
            .discover_descriptors(self.manager, self.id, characteristic);
    }

    /// Read a characteristic value. The result arrives as a `ValueUpdated` event.
    pub fn read_value(&self, characteristic: CharacteristicId) {
        self.sim
            .inner()
            .read_characteristic(self.manager, self.id, characteristic);
    }

    /// Read a descriptor value.
    pub fn read_descriptor_value(&self, descriptor: DescriptorId) {
        self.sim
            .inner()
            .read_descriptor(self.manager, self.id, descriptor);
    }

    /// Write a characteristic value. Writes without response are silently
    /// dropped while [`Self::can_send_write_without_response`] is false.
    pub fn write_value(
        &self,
        characteristic: CharacteristicId,
        data: impl Into<Bytes>,
        write_type: WriteType,
    ) {
        let inner = self.sim.inner();
        match write_type {
            WriteType::WithResponse => {
                inner.write_characteristic(self.manager, self.id, characteristic, data.into())
            }
            WriteType::WithoutResponse => {
                inner.write_command(self.manager, self.id, characteristic, data.into())
            }
        }
    }

    /// Write a descriptor value.
    pub fn write_descriptor_value(&self, descriptor: DescriptorId, data: impl Into<Bytes>) {
        self.sim
            .inner()
            .write_descriptor(self.manager, self.id, descriptor, data.into());
    }

    /// Subscribe to or unsubscribe from notifications/indications.
    pub fn set_notify_value(&self, enabled: bool, characteristic: CharacteristicId) {
        self.sim
            .inner()
            .set_notify(self.manager, self.id, characteristic, enabled);
    }

    /// Read the signal strength of the live link.
    pub fn read_rssi(&self) {
        self.sim.inner().read_rssi(self.manager, self.id);
    }

    /// Largest value accepted by a single write of `write_type`.
    pub fn maximum_write_value_length(&self, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => MAX_ATTRIBUTE_VALUE_LEN,
            WriteType::WithoutResponse => {
                let mtu = self
                    .with_projection(|p| p.mtu)
                    .unwrap_or(self.sim.config().default_mtu);
                mtu.saturating_sub(3)
            }
        }
    }

    /// Whether the next write without response will be transmitted.
    pub fn can_send_write_without_response(&self) -> bool {
        self.with_projection(|p| {
            p.state == ConnectionState::Connected && p.can_send_without_response
        })
        .unwrap_or(false)
    }

    /// L2CAP channels are not simulated.
    pub fn open_l2cap_channel(&self, psm: u16) -> ! {
        unimplemented!("L2CAP channel {psm} requested on simulated peripheral {}", self.id)
    }
}
