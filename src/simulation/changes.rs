//! Peripheral-side events: link loss, value pushes, renames, service
//! changes, movement and address rotation

use std::sync::Arc;

use bytes::Bytes;

use crate::ble::advertisement::AdvertisementConfig;
use crate::ble::gatt::{AttributeGraph, CharacteristicId};
use crate::ble::types::{ConnectionState, ManagerState, PeripheralId, Proximity};
use crate::ble::BleError;
use crate::central::events::CentralEvent;

use super::registry::{Guard, Projection, World};
use super::SimInner;

impl World {
    /// Guards of every live projection of `id` that is connected and
    /// passes `select`.
    fn connected_guards(
        &self,
        id: &PeripheralId,
        select: impl Fn(&Projection) -> bool,
    ) -> Vec<Guard> {
        self.managers
            .iter()
            .filter(|m| m.is_alive())
            .filter_map(|m| {
                let projection = m.projections.get(id)?;
                (projection.state == ConnectionState::Connected && select(projection)).then(|| {
                    Guard {
                        manager: m.id,
                        peripheral: *id,
                        expected: projection.state,
                        generation: projection.generation,
                        epoch: self.epoch,
                    }
                })
            })
            .collect()
    }
}

impl SimInner {
    /// The shared link is lost: every holder's count drops at once and each
    /// connected central notices after the interval, or after the
    /// supervision timeout for a silent loss.
    pub(crate) fn simulate_disconnection(self: &Arc<Self>, id: PeripheralId, error: Option<BleError>) {
        let error = error.unwrap_or(BleError::PeripheralDisconnected);
        let (guards, delay, behavior) = {
            self.sweep();
            let mut world = self.world();
            let Some(peripheral) = world.peripheral_mut(&id) else {
                log::warn!("simulate_disconnection: unknown peripheral {id}");
                return;
            };
            let was_connected = peripheral.is_connected();
            peripheral.virtual_connections = 0;
            let delay = if error.is_supervision_timeout() {
                self.config.supervision_timeout
            } else {
                peripheral.connection_interval()
            };
            let behavior = was_connected.then(|| peripheral.behavior());
            world.sever_links(&id);
            (world.connected_guards(&id, |_| true), delay, behavior)
        };

        log::debug!(
            "link to {id} lost ({error}), {} central(s) notified in {delay:?}",
            guards.len()
        );
        for guard in guards {
            let error = error.clone();
            self.schedule(delay, move |sim| {
                let mut world = sim.world();
                let Some(target) = world.resolve(&guard) else {
                    return;
                };
                target.projection.transition(ConnectionState::Disconnected);
                target.emit(CentralEvent::disconnected(guard.peripheral, Some(error)));
            });
        }
        if let Some(behavior) = behavior {
            behavior.on_disconnect(Some(&error));
        }
    }

    /// Another application connects to the peripheral.
    pub(crate) fn simulate_connection(&self, id: PeripheralId) {
        let mut world = self.world();
        let Some(peripheral) = world.peripheral_mut(&id) else {
            log::warn!("simulate_connection: unknown peripheral {id}");
            return;
        };
        if !peripheral.spec.is_connectable() {
            log::warn!("simulate_connection: peripheral {id} is not connectable");
            return;
        }
        peripheral.virtual_connections += 1;
        log::debug!(
            "peripheral {id} now held by {} central(s)",
            peripheral.virtual_connections
        );
    }

    /// Store a new canonical value and push it to every subscribed central.
    pub(crate) fn simulate_value_update(
        self: &Arc<Self>,
        id: PeripheralId,
        characteristic: CharacteristicId,
        value: Bytes,
    ) {
        let (guards, interval) = {
            let mut world = self.world();
            let Some(peripheral) = world.peripheral_mut(&id) else {
                log::warn!("simulate_value_update: unknown peripheral {id}");
                return;
            };
            if !peripheral
                .spec
                .services
                .set_characteristic_value(characteristic, value.clone())
            {
                log::debug!("simulate_value_update: {id} has no characteristic {characteristic}");
                return;
            }
            let interval = peripheral.connection_interval();
            if world.state != ManagerState::PoweredOn {
                return;
            }
            let guards = world.connected_guards(&id, |projection| {
                projection
                    .attributes
                    .characteristic(characteristic)
                    .map_or(false, |c| c.is_notifying())
            });
            (guards, interval)
        };

        for guard in guards {
            let value = value.clone();
            self.schedule(interval, move |sim| {
                let mut world = sim.world();
                let Some(target) = world.resolve(&guard) else {
                    return;
                };
                let attributes = &mut target.projection.attributes;
                let subscribed = attributes
                    .characteristic(characteristic)
                    .map_or(false, |c| c.is_notifying());
                if !subscribed {
                    return;
                }
                attributes.set_characteristic_value(characteristic, value.clone());
                let Some(snapshot) = attributes.characteristic(characteristic).cloned() else {
                    return;
                };
                target.emit(CentralEvent::CharacteristicValueUpdated {
                    peripheral: guard.peripheral,
                    characteristic: snapshot,
                    result: Ok(value),
                });
            });
        }
    }

    /// Rename the peripheral. Every connected central is told once.
    pub(crate) fn simulate_name_change(&self, id: PeripheralId, name: Option<String>) {
        self.sweep();
        let mut world = self.world();
        let World {
            peripherals,
            managers,
            ..
        } = &mut *world;
        let Some(peripheral) = peripherals.iter_mut().find(|p| p.id() == id) else {
            log::warn!("simulate_name_change: unknown peripheral {id}");
            return;
        };
        peripheral.spec.name = name.clone();
        for manager in managers.iter_mut() {
            let Some(projection) = manager.projections.get_mut(&id) else {
                continue;
            };
            projection.name = name.clone();
            if projection.state == ConnectionState::Connected {
                manager.emit(CentralEvent::NameChanged {
                    peripheral: id,
                    name: name.clone(),
                });
            }
        }
    }

    /// Edit the canonical attribute tree, then drop every discovered
    /// service that no longer exists from connected projections. `change`
    /// runs with the world locked and must not call back into the
    /// simulation.
    pub(crate) fn simulate_services_change(
        &self,
        id: PeripheralId,
        change: impl FnOnce(&mut AttributeGraph),
    ) {
        self.sweep();
        let mut world = self.world();
        let World {
            peripherals,
            managers,
            ..
        } = &mut *world;
        let Some(peripheral) = peripherals.iter_mut().find(|p| p.id() == id) else {
            log::warn!("simulate_services_change: unknown peripheral {id}");
            return;
        };
        change(&mut peripheral.spec.services);
        for manager in managers.iter_mut() {
            let Some(projection) = manager.projections.get_mut(&id) else {
                continue;
            };
            if projection.state != ConnectionState::Connected {
                continue;
            }
            let invalidated = projection
                .attributes
                .invalidate_against(&peripheral.spec.services);
            manager.emit(CentralEvent::ServicesInvalidated {
                peripheral: id,
                services: invalidated,
            });
        }
    }

    /// Move the peripheral. Leaving range drops its links with a timeout;
    /// coming back lets pending connect requests proceed.
    pub(crate) fn simulate_proximity_change(self: &Arc<Self>, id: PeripheralId, proximity: Proximity) {
        let (drop_links, pending) = {
            self.sweep();
            let mut world = self.world();
            let Some(peripheral) = world.peripheral_mut(&id) else {
                log::warn!("simulate_proximity_change: unknown peripheral {id}");
                return;
            };
            peripheral.spec.proximity = proximity;
            if !proximity.is_in_range() {
                (peripheral.is_connected(), Vec::new())
            } else {
                let pending: Vec<_> = world
                    .managers
                    .iter()
                    .filter(|m| m.is_alive())
                    .filter(|m| {
                        m.projections.get(&id).map_or(false, |p| {
                            p.state == ConnectionState::Connecting && !p.connect_in_flight
                        })
                    })
                    .map(|m| m.id)
                    .collect();
                (false, pending)
            }
        };

        if drop_links {
            self.simulate_disconnection(id, Some(BleError::ConnectionTimeout));
        }
        for manager in pending {
            self.try_connect(manager, id);
        }
    }

    /// The peripheral reboots: links are lost silently and advertising
    /// starts over.
    pub(crate) fn simulate_reset(self: &Arc<Self>, id: PeripheralId) {
        let Some((behavior, connected)) = self
            .world()
            .peripheral(&id)
            .map(|p| (p.behavior(), p.is_connected()))
        else {
            log::warn!("simulate_reset: unknown peripheral {id}");
            return;
        };
        behavior.on_reset();
        if connected {
            self.simulate_disconnection(id, Some(BleError::ConnectionTimeout));
        }
        let mut world = self.world();
        if let Some(peripheral) = world.peripheral_mut(&id) {
            self.start_advertising(peripheral);
        }
    }

    /// Rotate the peripheral's address. Centrals forget the old identity,
    /// including any connect request still pending on it.
    pub(crate) fn simulate_address_change(&self, id: PeripheralId, new_id: PeripheralId) {
        self.sweep();
        let mut world = self.world();
        if world.peripheral(&new_id).is_some() {
            log::warn!("simulate_address_change: {new_id} is already in use");
            return;
        }
        let Some(peripheral) = world.peripheral_mut(&id) else {
            log::warn!("simulate_address_change: unknown peripheral {id}");
            return;
        };
        if peripheral.is_connected() {
            log::warn!("simulate_address_change: peripheral {id} is connected");
            return;
        }
        peripheral.spec.identifier = new_id;
        peripheral.known = false;
        for manager in world.managers.iter_mut() {
            manager.projections.remove(&id);
        }
        log::debug!("peripheral {id} now advertises as {new_id}");
    }

    /// Replace the advertisement set. Delays count from now.
    pub(crate) fn simulate_advertisement_change(
        self: &Arc<Self>,
        id: PeripheralId,
        advertisements: Vec<AdvertisementConfig>,
    ) {
        let mut world = self.world();
        let Some(peripheral) = world.peripheral_mut(&id) else {
            log::warn!("simulate_advertisement_change: unknown peripheral {id}");
            return;
        };
        peripheral.spec.advertisements = advertisements;
        self.start_advertising(peripheral);
    }
}
