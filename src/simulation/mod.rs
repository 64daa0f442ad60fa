//! The simulation context
//!
//! A [`Simulation`] is the one shared world every simulated central
//! manager and peripheral lives in. All state sits behind a single mutex;
//! simulated latency is modelled with tokio timers, so a paused tokio
//! clock makes a whole run deterministic.
//!
//! Operations that start timers must be called from within a tokio
//! runtime.

pub mod behavior;
pub mod spec;

mod advertiser;
mod changes;
pub(crate) mod registry;
mod scheduler;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::ble::advertisement::AdvertisementConfig;
use crate::ble::gatt::{AttributeGraph, CharacteristicId};
use crate::ble::types::{Authorization, ManagerState, PeripheralId, Proximity};
use crate::ble::BleError;
use crate::central::events::CentralEvent;
use crate::config::SimulationConfig;

use self::behavior::SimulatedPeripheral;
use self::registry::{PeripheralState, World};
use self::spec::PeripheralSpec;

pub use self::registry::ManagerId;

pub(crate) struct SimInner {
    pub(crate) config: SimulationConfig,
    world: Mutex<World>,
}

impl SimInner {
    /// Lock the world. A panic while holding the lock leaves the world
    /// consistent enough to keep simulating, so poisoning is ignored.
    pub(crate) fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the links of dropped managers and tell the peripherals they
    /// held. Must not be called with the world locked.
    pub(crate) fn sweep(&self) {
        let released = self.world().sweep();
        for behavior in released {
            behavior.on_disconnect(None);
        }
    }
}

/// Handle to one simulated Bluetooth world. Cheap to clone.
#[derive(Clone)]
pub struct Simulation {
    inner: Arc<SimInner>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl Simulation {
    /// Create an empty simulation in `config.initial_state`.
    pub fn new(config: SimulationConfig) -> Self {
        let world = World::new(&config);
        Self {
            inner: Arc::new(SimInner {
                config,
                world: Mutex::new(world),
            }),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Arc<SimInner> {
        &self.inner
    }

    /// Replace the whole set of simulated peripherals and start their
    /// advertising timers.
    ///
    /// Only allowed before any central manager exists or while the adapter
    /// is powered off; otherwise the call is ignored with a warning.
    pub fn set_peripherals(&self, peripherals: Vec<PeripheralSpec>) {
        let attached = {
            self.inner.sweep();
            let mut world = self.inner.world();
            if !world.managers.is_empty() && world.state != ManagerState::PoweredOff {
                log::warn!(
                    "set_peripherals ignored: peripherals can only be replaced before any \
                     central manager exists or while powered off"
                );
                return;
            }
            for peripheral in world.peripherals.iter_mut() {
                peripheral.stop_advertising();
            }
            world.peripherals.clear();
            for manager in world.managers.iter_mut() {
                manager.projections.clear();
            }

            let mut attached = Vec::new();
            for spec in peripherals {
                if world.peripheral(&spec.identifier).is_some() {
                    log::warn!("duplicate peripheral identifier {} skipped", spec.identifier);
                    continue;
                }
                let key = world.next_key();
                let mut state = PeripheralState::new(key, spec);
                self.inner.start_advertising(&mut state);
                if let Some(behavior) = state.spec.behavior.clone() {
                    attached.push((behavior, SimulatedPeripheral::new(&self.inner, key)));
                }
                world.peripherals.push(state);
            }
            log::info!("simulating {} peripheral(s)", world.peripherals.len());
            attached
        };
        for (behavior, handle) in attached {
            behavior.on_attach(handle);
        }
    }

    /// Current adapter state.
    pub fn adapter_state(&self) -> ManagerState {
        self.inner.world().state
    }

    /// Change the adapter's power state.
    ///
    /// Leaving `PoweredOn` stops every scan, drops every manager's
    /// projections, severs all links and invalidates pending completions.
    /// Every manager is told about the new state.
    pub fn set_adapter_state(&self, state: ManagerState) {
        let severed = {
            self.inner.sweep();
            let mut world = self.inner.world();
            if world.state == state {
                return;
            }
            log::info!("adapter state {:?} -> {:?}", world.state, state);
            world.state = state;

            let mut severed = Vec::new();
            if state != ManagerState::PoweredOn {
                world.epoch += 1;
                let World {
                    managers,
                    peripherals,
                    ..
                } = &mut *world;
                for manager in managers.iter_mut() {
                    manager.scan = None;
                    manager.projections.clear();
                }
                for peripheral in peripherals.iter_mut() {
                    if peripheral.is_connected() {
                        severed.push(peripheral.behavior());
                    }
                    peripheral.virtual_connections = 0;
                }
            }
            for manager in world.managers.iter() {
                manager.emit(CentralEvent::StateChanged(state));
            }
            severed
        };
        for behavior in severed {
            behavior.on_disconnect(Some(&BleError::PeripheralDisconnected));
        }
    }

    /// Shorthand for `set_adapter_state(PoweredOn)`.
    pub fn power_on(&self) {
        self.set_adapter_state(ManagerState::PoweredOn);
    }

    /// Shorthand for `set_adapter_state(PoweredOff)`.
    pub fn power_off(&self) {
        self.set_adapter_state(ManagerState::PoweredOff);
    }

    /// Override the application's Bluetooth authorization. `None` defers
    /// to the environment default, `AllowedAlways`.
    pub fn set_authorization(&self, authorization: Option<Authorization>) {
        self.inner.world().authorization = authorization;
    }

    /// Effective authorization, after applying the default.
    pub fn authorization(&self) -> Authorization {
        self.inner
            .world()
            .authorization
            .unwrap_or(Authorization::AllowedAlways)
    }

    /// Reset the simulation: forget every peripheral and manager, cancel
    /// every timer and pending completion.
    pub fn tear_down(&self) {
        let mut world = self.inner.world();
        world.epoch += 1;
        for peripheral in world.peripherals.iter_mut() {
            peripheral.stop_advertising();
        }
        world.peripherals.clear();
        world.managers.clear();
        world.state = self.inner.config.initial_state;
        world.authorization = None;
        log::info!("simulation torn down");
    }

    // -----------------------------------------------------------------------
    // Peripheral-side controls
    // -----------------------------------------------------------------------

    /// Control handle for a registered peripheral.
    pub fn peripheral_handle(&self, id: &PeripheralId) -> Option<SimulatedPeripheral> {
        let key = self.inner.world().peripheral(id)?.key;
        Some(SimulatedPeripheral::new(&self.inner, key))
    }

    /// Move the peripheral. Out of range drops its links with a timeout.
    pub fn simulate_proximity_change(&self, id: &PeripheralId, proximity: Proximity) {
        self.inner.simulate_proximity_change(*id, proximity);
    }

    /// Another application connects to the peripheral.
    pub fn simulate_connection(&self, id: &PeripheralId) {
        self.inner.simulate_connection(*id);
    }

    /// The link to the peripheral is lost for every central holding it.
    /// `None` reports a plain peripheral disconnection.
    pub fn simulate_disconnection(&self, id: &PeripheralId, error: Option<BleError>) {
        self.inner.simulate_disconnection(*id, error);
    }

    /// The peripheral reboots: its links time out and advertising restarts.
    pub fn simulate_reset(&self, id: &PeripheralId) {
        self.inner.simulate_reset(*id);
    }

    /// Rotate the peripheral's address. Centrals forget the old identity.
    pub fn simulate_address_change(&self, id: &PeripheralId, new_id: PeripheralId) {
        self.inner.simulate_address_change(*id, new_id);
    }

    /// Replace the advertisement set; delays count from now.
    pub fn simulate_advertisement_change(
        &self,
        id: &PeripheralId,
        advertisements: Vec<AdvertisementConfig>,
    ) {
        self.inner.simulate_advertisement_change(*id, advertisements);
    }

    /// Change a characteristic value and notify subscribed centrals.
    pub fn simulate_value_update(
        &self,
        id: &PeripheralId,
        characteristic: CharacteristicId,
        value: impl Into<Bytes>,
    ) {
        self.inner
            .simulate_value_update(*id, characteristic, value.into());
    }

    /// Rename the peripheral. Connected centrals see the new name at once.
    pub fn simulate_name_change(&self, id: &PeripheralId, name: Option<String>) {
        self.inner.simulate_name_change(*id, name);
    }

    /// Edit the canonical service tree. Services kept untouched keep their
    /// identity; connected centrals lose the rest of what they discovered.
    ///
    /// The edit is applied atomically with respect to every other
    /// simulation operation, so `change` must not use the simulation.
    pub fn simulate_services_change(&self, id: &PeripheralId, change: impl FnOnce(&mut AttributeGraph)) {
        self.inner.simulate_services_change(*id, change);
    }

    /// `None` for an unknown peripheral.
    pub fn is_connected(&self, id: &PeripheralId) -> Option<bool> {
        self.inner.world().peripheral(id).map(|p| p.is_connected())
    }

    /// Number of live links held by managers and other applications.
    pub fn virtual_connections(&self, id: &PeripheralId) -> Option<usize> {
        self.inner
            .world()
            .peripheral(id)
            .map(|p| p.virtual_connections)
    }

    /// Snapshot of a peripheral's canonical attribute tree.
    pub fn services(&self, id: &PeripheralId) -> Option<AttributeGraph> {
        self.inner
            .world()
            .peripheral(id)
            .map(|p| p.spec.services.clone())
    }
}
