//! Central manager: scanning, connecting and retrieving peripherals

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::types::{Authorization, ManagerState, PeripheralId};
use crate::simulation::registry::{ManagerId, ManagerRecord, ManagerToken, ScanSession};
use crate::simulation::Simulation;

use super::events::{CentralEvent, EventStream};
use super::peripheral::Peripheral;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Report every received advertisement instead of once per scan.
    pub allow_duplicates: bool,
}

/// One application's central role in a [`Simulation`].
///
/// The registration lives as long as the manager or any [`Peripheral`]
/// handle it produced.
pub struct CentralManager {
    sim: Simulation,
    id: ManagerId,
    token: Arc<ManagerToken>,
}

impl fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralManager").field("id", &self.id).finish()
    }
}

impl CentralManager {
    /// Register a new manager. The first event on the returned stream is
    /// the adapter's current state.
    pub fn new(sim: &Simulation) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = Arc::new(ManagerToken);
        let id = {
            sim.inner().sweep();
            let mut world = sim.inner().world();
            let id = world.next_manager_id();
            let _ = tx.send(CentralEvent::StateChanged(world.state));
            world.managers.push(ManagerRecord {
                id,
                token: Arc::downgrade(&token),
                events: tx,
                scan: None,
                projections: HashMap::new(),
            });
            id
        };
        log::debug!("central manager {id:?} registered");
        (
            Self {
                sim: sim.clone(),
                id,
                token,
            },
            EventStream::new(rx),
        )
    }

    /// Identifier of this manager within the simulation.
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// Current adapter state. Shared by every manager.
    pub fn state(&self) -> ManagerState {
        self.sim.adapter_state()
    }

    /// Bluetooth authorization granted to the application.
    pub fn authorization(&self) -> Authorization {
        self.sim.authorization()
    }

    /// Whether a scan session is running.
    pub fn is_scanning(&self) -> bool {
        self.sim
            .inner()
            .world()
            .manager(self.id)
            .map_or(false, |m| m.scan.is_some())
    }

    /// Start (or restart) a scan session. Only advertisements carrying one
    /// of `services` are reported; `None` or an empty list reports all.
    pub fn scan_for_peripherals(&self, services: Option<Vec<Uuid>>, options: ScanOptions) {
        self.sim.inner().sweep();
        let mut world = self.sim.inner().world();
        if world.state != ManagerState::PoweredOn {
            log::warn!("scan_for_peripherals ignored: adapter is {:?}", world.state);
            return;
        }
        let Some(record) = world.manager_mut(self.id) else {
            return;
        };
        record.scan = Some(ScanSession {
            filter: services,
            allow_duplicates: options.allow_duplicates,
        });
        for projection in record.projections.values_mut() {
            projection.reported = false;
        }
    }

    /// End the scan session. Advertisements received afterwards are ignored.
    pub fn stop_scan(&self) {
        let mut world = self.sim.inner().world();
        if world.state != ManagerState::PoweredOn {
            log::warn!("stop_scan ignored: adapter is {:?}", world.state);
            return;
        }
        if let Some(record) = world.manager_mut(self.id) {
            record.scan = None;
        }
    }

    /// Request a connection. It completes with `Connected` or
    /// `FailedToConnect` and never times out.
    pub fn connect(&self, peripheral: &PeripheralId) {
        self.sim.inner().connect(self.id, *peripheral);
    }

    /// Abandon a pending connect request or tear down the connection.
    pub fn cancel_peripheral_connection(&self, peripheral: &PeripheralId) {
        self.sim.inner().cancel_connection(self.id, *peripheral);
    }

    /// Handles for the given identifiers, for peripherals this system has
    /// seen before. Unknown identifiers are skipped.
    pub fn retrieve_peripherals(&self, identifiers: &[PeripheralId]) -> Vec<Peripheral> {
        self.sim.inner().sweep();
        let mut world = self.sim.inner().world();
        if world.state != ManagerState::PoweredOn {
            log::warn!("retrieve_peripherals ignored: adapter is {:?}", world.state);
            return Vec::new();
        }
        let default_mtu = self.sim.config().default_mtu;
        let mut found = Vec::new();
        for id in identifiers {
            let retrievable = world
                .peripheral(id)
                .map_or(false, |p| p.known || p.is_connected() || p.spec.allow_retrieval);
            if retrievable && world.ensure_projection(self.id, id, default_mtu).is_some() {
                found.push(self.handle(*id));
            }
        }
        found
    }

    /// Handles for connected peripherals exposing any of `services`. An
    /// empty list matches every connected peripheral.
    pub fn retrieve_connected_peripherals(&self, services: &[Uuid]) -> Vec<Peripheral> {
        self.sim.inner().sweep();
        let mut world = self.sim.inner().world();
        if world.state != ManagerState::PoweredOn {
            log::warn!(
                "retrieve_connected_peripherals ignored: adapter is {:?}",
                world.state
            );
            return Vec::new();
        }
        let ids: Vec<PeripheralId> = world
            .peripherals
            .iter()
            .filter(|p| p.is_connected())
            .filter(|p| {
                services.is_empty()
                    || p.spec
                        .services
                        .service_uuids()
                        .iter()
                        .any(|uuid| services.contains(uuid))
            })
            .map(|p| p.id())
            .collect();

        let default_mtu = self.sim.config().default_mtu;
        ids.into_iter()
            .filter(|id| world.ensure_projection(self.id, id, default_mtu).is_some())
            .map(|id| self.handle(id))
            .collect()
    }

    /// Handle for a peripheral this manager already discovered or retrieved.
    pub fn peripheral(&self, id: &PeripheralId) -> Option<Peripheral> {
        let world = self.sim.inner().world();
        world.manager(self.id)?.projections.get(id)?;
        Some(self.handle(*id))
    }

    fn handle(&self, id: PeripheralId) -> Peripheral {
        Peripheral::new(self.sim.clone(), self.id, self.token.clone(), id)
    }
}
