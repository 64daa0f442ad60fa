//! Connection state machine and timed GATT operations
//!
//! Each request is answered by the peripheral's behavior right away; the
//! result is applied and delivered after a simulated link delay. Every
//! completion carries a [`Guard`] and becomes a no-op if the projection
//! moved on in the meantime.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicId, DescriptorId, ServiceId};
use crate::ble::types::{ConnectionState, ManagerState, PeripheralId};
use crate::ble::BleError;
use crate::central::events::CentralEvent;

use super::behavior::PeripheralBehavior;
use super::registry::{jitter_rssi, Guard, ManagerId, PeripheralState, Projection};
use super::SimInner;

/// ATT opcode and handle overhead of every packet.
const ATT_HEADER_LEN: usize = 3;

/// Number of link-layer packets needed to carry `len` bytes.
pub(crate) fn packet_count(len: usize, mtu: usize) -> u32 {
    let payload = mtu.saturating_sub(ATT_HEADER_LEN).max(1);
    len.div_ceil(payload).max(1) as u32
}

/// Delay of a discovery answer: one round trip per newly found attribute.
fn discovery_delay(interval: Duration, result: &Result<(), BleError>, found: usize) -> Duration {
    match result {
        Ok(()) => interval * found.max(1) as u32,
        Err(_) => interval,
    }
}

/// A validated request on a connected projection.
struct Prepared<T> {
    guard: Guard,
    behavior: Arc<dyn PeripheralBehavior>,
    interval: Duration,
    mtu: usize,
    lookup: T,
}

impl SimInner {
    /// Run `complete` after `delay`, unless the simulation is gone by then.
    pub(crate) fn schedule<F>(self: &Arc<Self>, delay: Duration, complete: F)
    where
        F: FnOnce(&Arc<SimInner>) + Send + 'static,
    {
        let sim = Arc::downgrade(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(sim) = sim.upgrade() {
                complete(&sim);
            }
        });
    }

    /// Check the preconditions shared by every GATT operation. `lookup`
    /// inspects the projection and canonical peripheral; `None` means the
    /// request targets something this projection doesn't know.
    fn prepare<T>(
        &self,
        manager: ManagerId,
        id: &PeripheralId,
        operation: &str,
        lookup: impl FnOnce(&Projection, &PeripheralState) -> Option<T>,
    ) -> Option<Prepared<T>> {
        self.sweep();
        let mut world = self.world();
        if world.state != ManagerState::PoweredOn {
            log::warn!("{operation} ignored: adapter is {:?}", world.state);
            return None;
        }
        let guard = world.guard(manager, id)?;
        if guard.expected != ConnectionState::Connected {
            log::warn!("{operation} ignored: peripheral {id} is {:?}", guard.expected);
            return None;
        }
        let projection = world.manager(manager)?.projections.get(id)?;
        let peripheral = world.peripheral(id)?;
        let Some(lookup) = lookup(projection, peripheral) else {
            log::debug!("{operation} on {id} dropped: attribute not discovered");
            return None;
        };
        Some(Prepared {
            guard,
            behavior: peripheral.behavior(),
            interval: peripheral.connection_interval(),
            mtu: projection.mtu,
            lookup,
        })
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    pub(crate) fn connect(self: &Arc<Self>, manager: ManagerId, id: PeripheralId) {
        {
            self.sweep();
            let mut world = self.world();
            if world.state != ManagerState::PoweredOn {
                log::warn!("connect ignored: adapter is {:?}", world.state);
                return;
            }
            let default_mtu = self.config.default_mtu;
            let Some(projection) = world.ensure_projection(manager, &id, default_mtu) else {
                log::debug!("connect to unknown peripheral {id} ignored");
                return;
            };
            if projection.state != ConnectionState::Disconnected {
                log::warn!("connect ignored: peripheral {id} is {:?}", projection.state);
                return;
            }
            projection.transition(ConnectionState::Connecting);
        }
        self.try_connect(manager, id);
    }

    /// Try to complete a pending connect request. The request stays
    /// pending while the peripheral is out of range or not connectable.
    pub(crate) fn try_connect(self: &Arc<Self>, manager: ManagerId, id: PeripheralId) {
        let (guard, behavior, interval, shared) = {
            let mut world = self.world();
            let Some(guard) = world.guard(manager, &id) else {
                return;
            };
            if guard.expected != ConnectionState::Connecting {
                return;
            }
            let Some(peripheral) = world.peripheral(&id) else {
                return;
            };
            if !peripheral.spec.proximity.is_in_range() {
                log::debug!("connect to {id} pending: out of range");
                return;
            }
            let (Some(behavior), Some(interval)) = (
                peripheral.spec.behavior.clone(),
                peripheral.spec.connection_interval,
            ) else {
                log::debug!("connect to {id} pending: peripheral is not connectable");
                return;
            };
            let shared = peripheral.is_connected();
            match world.projection_mut(manager, &id) {
                Some(projection) if !projection.connect_in_flight => {
                    projection.connect_in_flight = true;
                }
                _ => return,
            }
            (guard, behavior, interval, shared)
        };

        // Another holder already keeps the link up.
        if shared {
            self.schedule(Duration::ZERO, move |sim| {
                sim.complete_connection(guard, Ok(()), true)
            });
            return;
        }
        let result = behavior.on_connect_request();
        self.schedule(interval, move |sim| {
            sim.complete_connection(guard, result, false)
        });
    }

    fn complete_connection(
        self: &Arc<Self>,
        guard: Guard,
        result: Result<(), BleError>,
        shared: bool,
    ) {
        let mut world = self.world();
        let Some(target) = world.resolve(&guard) else {
            log::debug!("connect completion for {} superseded", guard.peripheral);
            return;
        };
        let id = guard.peripheral;
        if shared && !target.peripheral.is_connected() {
            // The link went down before this holder could join it.
            log::debug!("shared link to {id} lost, connecting on our own");
            target.projection.connect_in_flight = false;
            drop(world);
            self.try_connect(guard.manager, id);
            return;
        }
        match result {
            Ok(()) => {
                target.peripheral.virtual_connections += 1;
                target.projection.transition(ConnectionState::Connected);
                target.projection.holds_link = true;
                target.projection.credits = self.config.write_without_response_credits;
                target.projection.can_send_without_response = true;
                target.projection.mtu = target
                    .peripheral
                    .spec
                    .mtu
                    .unwrap_or(self.config.default_mtu);
                if let Some(name) = &target.peripheral.spec.name {
                    target.projection.name = Some(name.clone());
                }
                target.emit(CentralEvent::Connected(id));
            }
            Err(error) => {
                target.projection.transition(ConnectionState::Disconnected);
                target.emit(CentralEvent::FailedToConnect {
                    peripheral: id,
                    error,
                });
            }
        }
    }

    pub(crate) fn cancel_connection(self: &Arc<Self>, manager: ManagerId, id: PeripheralId) {
        self.sweep();
        let mut world = self.world();
        if world.state != ManagerState::PoweredOn {
            log::warn!("cancel_peripheral_connection ignored: adapter is {:?}", world.state);
            return;
        }
        let Some(state) = world.projection_mut(manager, &id).map(|p| p.state) else {
            log::debug!("cancel for unknown peripheral {id} ignored");
            return;
        };
        match state {
            ConnectionState::Connecting => {
                if let Some(projection) = world.projection_mut(manager, &id) {
                    projection.transition(ConnectionState::Disconnected);
                }
                if let Some(record) = world.manager(manager) {
                    record.emit(CentralEvent::disconnected(id, None));
                }
            }
            ConnectionState::Connected => {
                if let Some(projection) = world.projection_mut(manager, &id) {
                    projection.transition(ConnectionState::Disconnecting);
                }
                let guard = world.guard(manager, &id);
                let interval = world
                    .peripheral(&id)
                    .map(|p| p.connection_interval())
                    .unwrap_or_default();
                drop(world);
                if let Some(guard) = guard {
                    self.schedule(interval, move |sim| sim.complete_disconnection(guard));
                }
            }
            state => log::debug!("cancel for {id} ignored while {state:?}"),
        }
    }

    fn complete_disconnection(&self, guard: Guard) {
        let behavior = {
            let mut world = self.world();
            let Some(target) = world.resolve(&guard) else {
                log::debug!("disconnect completion for {} superseded", guard.peripheral);
                return;
            };
            let held = target.projection.holds_link;
            target.projection.transition(ConnectionState::Disconnected);
            if held {
                target.peripheral.virtual_connections =
                    target.peripheral.virtual_connections.saturating_sub(1);
            }
            target.emit(CentralEvent::disconnected(guard.peripheral, None));
            held.then(|| target.peripheral.behavior())
        };
        // A holder whose link was already lost has been told about it.
        if let Some(behavior) = behavior {
            behavior.on_disconnect(None);
        }
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub(crate) fn discover_services(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        filter: Option<Vec<Uuid>>,
    ) {
        let Some(op) = self.prepare(manager, &id, "discover_services", |projection, peripheral| {
            Some(
                projection
                    .attributes
                    .undiscovered_services(&peripheral.spec.services, filter.as_deref())
                    .len(),
            )
        }) else {
            return;
        };
        let result = op.behavior.on_discover_services(filter.as_deref());
        let delay = discovery_delay(op.interval, &result, op.lookup);
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            if result.is_ok() {
                target
                    .projection
                    .attributes
                    .merge_services(&target.peripheral.spec.services, filter.as_deref());
            }
            target.emit(CentralEvent::ServicesDiscovered {
                peripheral: guard.peripheral,
                result,
            });
        });
    }

    pub(crate) fn discover_included_services(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        service: ServiceId,
        filter: Option<Vec<Uuid>>,
    ) {
        let Some(op) = self.prepare(
            manager,
            &id,
            "discover_included_services",
            |projection, peripheral| {
                let canonical = &peripheral.spec.services;
                let found = projection.attributes.undiscovered_included_services(
                    canonical,
                    service,
                    filter.as_deref(),
                )?;
                Some((found.len(), canonical.service(service)?.clone()))
            },
        ) else {
            return;
        };
        let (found, canonical) = op.lookup;
        let result = op
            .behavior
            .on_discover_included_services(filter.as_deref(), &canonical);
        let delay = discovery_delay(op.interval, &result, found);
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let attributes = &mut target.projection.attributes;
            if result.is_ok() {
                attributes.merge_included_services(
                    &target.peripheral.spec.services,
                    service,
                    filter.as_deref(),
                );
            }
            let Some(service) = attributes.service(service).cloned() else {
                log::debug!("service {service} vanished before discovery completed");
                return;
            };
            target.emit(CentralEvent::IncludedServicesDiscovered {
                peripheral: guard.peripheral,
                service,
                result,
            });
        });
    }

    pub(crate) fn discover_characteristics(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        service: ServiceId,
        filter: Option<Vec<Uuid>>,
    ) {
        let Some(op) = self.prepare(
            manager,
            &id,
            "discover_characteristics",
            |projection, peripheral| {
                let canonical = &peripheral.spec.services;
                let found = projection.attributes.undiscovered_characteristics(
                    canonical,
                    service,
                    filter.as_deref(),
                )?;
                Some((found.len(), canonical.service(service)?.clone()))
            },
        ) else {
            return;
        };
        let (found, canonical) = op.lookup;
        let result = op
            .behavior
            .on_discover_characteristics(filter.as_deref(), &canonical);
        let delay = discovery_delay(op.interval, &result, found);
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let attributes = &mut target.projection.attributes;
            if result.is_ok() {
                attributes.merge_characteristics(
                    &target.peripheral.spec.services,
                    service,
                    filter.as_deref(),
                );
            }
            let Some(service) = attributes.service(service).cloned() else {
                log::debug!("service {service} vanished before discovery completed");
                return;
            };
            target.emit(CentralEvent::CharacteristicsDiscovered {
                peripheral: guard.peripheral,
                service,
                result,
            });
        });
    }

    pub(crate) fn discover_descriptors(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        characteristic: CharacteristicId,
    ) {
        let Some(op) = self.prepare(manager, &id, "discover_descriptors", |projection, peripheral| {
            let canonical = &peripheral.spec.services;
            let found = projection
                .attributes
                .undiscovered_descriptors(canonical, characteristic)?;
            Some((found.len(), canonical.characteristic(characteristic)?.clone()))
        }) else {
            return;
        };
        let (found, canonical) = op.lookup;
        let result = op.behavior.on_discover_descriptors(&canonical);
        let delay = discovery_delay(op.interval, &result, found);
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let attributes = &mut target.projection.attributes;
            if result.is_ok() {
                attributes.merge_descriptors(&target.peripheral.spec.services, characteristic);
            }
            let Some(characteristic) = attributes.characteristic(characteristic).cloned() else {
                log::debug!("characteristic {characteristic} vanished before discovery completed");
                return;
            };
            target.emit(CentralEvent::DescriptorsDiscovered {
                peripheral: guard.peripheral,
                characteristic,
                result,
            });
        });
    }

    // -----------------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------------

    pub(crate) fn read_characteristic(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        characteristic: CharacteristicId,
    ) {
        let Some(op) = self.prepare(manager, &id, "read_value", |projection, peripheral| {
            if !projection.attributes.contains_characteristic(characteristic) {
                return None;
            }
            peripheral.spec.services.characteristic(characteristic).cloned()
        }) else {
            return;
        };
        let result = op.behavior.on_read_characteristic(&op.lookup);
        let guard = op.guard;
        self.schedule(op.interval, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let attributes = &mut target.projection.attributes;
            if let Ok(value) = &result {
                attributes.set_characteristic_value(characteristic, value.clone());
            }
            let Some(characteristic) = attributes.characteristic(characteristic).cloned() else {
                return;
            };
            target.emit(CentralEvent::CharacteristicValueUpdated {
                peripheral: guard.peripheral,
                characteristic,
                result,
            });
        });
    }

    pub(crate) fn read_descriptor(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        descriptor: DescriptorId,
    ) {
        let Some(op) = self.prepare(
            manager,
            &id,
            "read_descriptor_value",
            |projection, peripheral| {
                if !projection.attributes.contains_descriptor(descriptor) {
                    return None;
                }
                peripheral.spec.services.descriptor(descriptor).cloned()
            },
        ) else {
            return;
        };
        let result = op.behavior.on_read_descriptor(&op.lookup);
        let guard = op.guard;
        self.schedule(op.interval, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let attributes = &mut target.projection.attributes;
            if let Ok(value) = &result {
                attributes.set_descriptor_value(descriptor, value.clone());
            }
            let Some(descriptor) = attributes.descriptor(descriptor).cloned() else {
                return;
            };
            target.emit(CentralEvent::DescriptorValueUpdated {
                peripheral: guard.peripheral,
                descriptor,
                result,
            });
        });
    }

    pub(crate) fn write_characteristic(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        characteristic: CharacteristicId,
        data: Bytes,
    ) {
        let Some(op) = self.prepare(manager, &id, "write_value", |projection, peripheral| {
            if !projection.attributes.contains_characteristic(characteristic) {
                return None;
            }
            peripheral.spec.services.characteristic(characteristic).cloned()
        }) else {
            return;
        };
        let result = op.behavior.on_write_characteristic(&op.lookup, &data);
        let delay = match result {
            Ok(()) => op.interval * packet_count(data.len(), op.mtu),
            Err(_) => op.interval,
        };
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let Some(characteristic) = target
                .projection
                .attributes
                .characteristic(characteristic)
                .cloned()
            else {
                return;
            };
            target.emit(CentralEvent::CharacteristicValueWritten {
                peripheral: guard.peripheral,
                characteristic,
                result,
            });
        });
    }

    /// Write without response. Consumes one credit; without credits the
    /// write is dropped.
    pub(crate) fn write_command(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        characteristic: CharacteristicId,
        data: Bytes,
    ) {
        let Some(op) = self.prepare(manager, &id, "write_value", |projection, peripheral| {
            if !projection.attributes.contains_characteristic(characteristic) {
                return None;
            }
            peripheral.spec.services.characteristic(characteristic).cloned()
        }) else {
            return;
        };
        {
            let mut world = self.world();
            let Some(target) = world.resolve(&op.guard) else {
                return;
            };
            let projection = target.projection;
            if projection.credits == 0 {
                log::debug!("write command to {id} dropped: no credits left");
                return;
            }
            projection.credits -= 1;
            if projection.credits == 0 {
                projection.can_send_without_response = false;
            }
        }
        op.behavior.on_write_command(&op.lookup, &data);
        let guard = op.guard;
        self.schedule(Duration::ZERO, move |sim| sim.return_credit(guard));
    }

    fn return_credit(&self, guard: Guard) {
        let mut world = self.world();
        let Some(target) = world.resolve(&guard) else {
            return;
        };
        let cap = self.config.write_without_response_credits;
        target.projection.credits = (target.projection.credits + 1).min(cap);
        if !target.projection.can_send_without_response {
            target.projection.can_send_without_response = true;
            target.emit(CentralEvent::ReadyToSendWithoutResponse(guard.peripheral));
        }
    }

    pub(crate) fn write_descriptor(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        descriptor: DescriptorId,
        data: Bytes,
    ) {
        let Some(op) = self.prepare(
            manager,
            &id,
            "write_descriptor_value",
            |projection, peripheral| {
                if !projection.attributes.contains_descriptor(descriptor) {
                    return None;
                }
                peripheral.spec.services.descriptor(descriptor).cloned()
            },
        ) else {
            return;
        };
        let result = op.behavior.on_write_descriptor(&op.lookup, &data);
        let delay = match result {
            Ok(()) => op.interval * packet_count(data.len(), op.mtu),
            Err(_) => op.interval,
        };
        let guard = op.guard;
        self.schedule(delay, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let Some(descriptor) = target.projection.attributes.descriptor(descriptor).cloned()
            else {
                return;
            };
            target.emit(CentralEvent::DescriptorValueWritten {
                peripheral: guard.peripheral,
                descriptor,
                result,
            });
        });
    }

    // -----------------------------------------------------------------------
    // Subscriptions and RSSI
    // -----------------------------------------------------------------------

    pub(crate) fn set_notify(
        self: &Arc<Self>,
        manager: ManagerId,
        id: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
    ) {
        let Some(op) = self.prepare(manager, &id, "set_notify_value", |projection, peripheral| {
            if !projection.attributes.contains_characteristic(characteristic) {
                return None;
            }
            let current = projection
                .attributes
                .characteristic(characteristic)?
                .is_notifying();
            let canonical = peripheral.spec.services.characteristic(characteristic)?;
            Some((current, canonical.clone()))
        }) else {
            return;
        };
        let (current, canonical) = op.lookup;
        if current == enabled {
            log::debug!("notify state of {characteristic} on {id} already {enabled}");
            return;
        }
        let result = op.behavior.on_set_notify(enabled, &canonical);
        let guard = op.guard;
        let behavior = op.behavior;
        self.schedule(op.interval, move |sim| {
            let confirmed = {
                let mut world = sim.world();
                let Some(target) = world.resolve(&guard) else {
                    return;
                };
                if result.is_ok() {
                    target
                        .projection
                        .attributes
                        .set_notifying(characteristic, enabled);
                    target
                        .peripheral
                        .spec
                        .services
                        .set_notifying(characteristic, enabled);
                }
                let Some(local) = target
                    .projection
                    .attributes
                    .characteristic(characteristic)
                    .cloned()
                else {
                    return;
                };
                let succeeded = result.is_ok();
                target.emit(CentralEvent::NotificationStateChanged {
                    peripheral: guard.peripheral,
                    characteristic: local,
                    result,
                });
                if !succeeded {
                    return;
                }
                target
                    .peripheral
                    .spec
                    .services
                    .characteristic(characteristic)
                    .cloned()
            };
            if let Some(canonical) = confirmed {
                behavior.on_notify_state_changed(&canonical);
            }
        });
    }

    pub(crate) fn read_rssi(self: &Arc<Self>, manager: ManagerId, id: PeripheralId) {
        let Some(op) = self.prepare(manager, &id, "read_rssi", |_, _| Some(())) else {
            return;
        };
        let guard = op.guard;
        self.schedule(Duration::ZERO, move |sim| {
            let mut world = sim.world();
            let Some(target) = world.resolve(&guard) else {
                return;
            };
            let rssi = jitter_rssi(
                target.rng,
                target.peripheral.spec.proximity,
                sim.config.rssi_deviation,
            );
            target.emit(CentralEvent::RssiRead {
                peripheral: guard.peripheral,
                result: Ok(rssi),
            });
        });
    }
}
