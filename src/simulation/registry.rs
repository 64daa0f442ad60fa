//! Authoritative simulation state
//!
//! One `World` per simulation, guarded by a single mutex: the known
//! peripherals with their shared connection counters, and the registered
//! central managers with their private projections of those peripherals.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::ble::gatt::AttributeGraph;
use crate::ble::types::{Authorization, ConnectionState, ManagerState, PeripheralId, Proximity};
use crate::central::events::CentralEvent;
use crate::config::SimulationConfig;

use super::behavior::{AcceptAll, PeripheralBehavior};
use super::spec::PeripheralSpec;

/// Identifier of a registered central manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(pub(crate) u64);

/// Internal key of a registered peripheral. Unlike its identifier, it
/// survives address rotation and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeripheralKey(pub(crate) u64);

/// Liveness marker of a central manager. The registry only holds a weak
/// reference; once the manager and all its peripheral handles are gone the
/// registration is swept.
#[derive(Debug)]
pub(crate) struct ManagerToken;

pub(crate) struct PeripheralState {
    pub key: PeripheralKey,
    pub spec: PeripheralSpec,
    /// Number of centrals (managers or other apps) holding a connection.
    pub virtual_connections: usize,
    /// Eligible for retrieval without scanning.
    pub known: bool,
    pub advertising: Vec<AbortHandle>,
}

impl PeripheralState {
    pub fn new(key: PeripheralKey, spec: PeripheralSpec) -> Self {
        Self {
            key,
            virtual_connections: usize::from(spec.initially_connected),
            known: spec.allow_retrieval,
            spec,
            advertising: Vec::new(),
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.spec.identifier
    }

    pub fn is_connected(&self) -> bool {
        self.virtual_connections > 0
    }

    /// The behavior used for GATT traffic. A peripheral without one can't
    /// be connected to, so the fallback only matters for links other apps
    /// established.
    pub fn behavior(&self) -> Arc<dyn PeripheralBehavior> {
        self.spec
            .behavior
            .clone()
            .unwrap_or_else(|| Arc::new(AcceptAll))
    }

    pub fn connection_interval(&self) -> std::time::Duration {
        self.spec.connection_interval.unwrap_or_default()
    }

    pub fn stop_advertising(&mut self) {
        for handle in self.advertising.drain(..) {
            handle.abort();
        }
    }
}

/// One manager's private view of one peripheral.
#[derive(Debug)]
pub(crate) struct Projection {
    pub state: ConnectionState,
    /// Bumped on every state transition; pending completions carry the
    /// generation they were scheduled in.
    pub generation: u64,
    pub attributes: AttributeGraph,
    /// Already reported during the current scan session.
    pub reported: bool,
    pub name: Option<String>,
    /// A connect completion is scheduled; the request is no longer pending.
    pub connect_in_flight: bool,
    /// Counted in the peripheral's `virtual_connections`. Cleared as soon
    /// as the link is lost, even while the loss is still unnoticed.
    pub holds_link: bool,
    pub credits: usize,
    pub can_send_without_response: bool,
    pub mtu: usize,
}

impl Projection {
    pub fn new(name: Option<String>, mtu: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            attributes: AttributeGraph::new(),
            reported: false,
            name,
            connect_in_flight: false,
            holds_link: false,
            credits: 0,
            can_send_without_response: false,
            mtu,
        }
    }

    pub fn transition(&mut self, state: ConnectionState) {
        log::debug!("projection {:?} -> {:?}", self.state, state);
        self.state = state;
        self.generation += 1;
        self.connect_in_flight = false;
        if state == ConnectionState::Disconnected {
            self.attributes.clear();
            self.holds_link = false;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScanSession {
    pub filter: Option<Vec<Uuid>>,
    pub allow_duplicates: bool,
}

pub(crate) struct ManagerRecord {
    pub id: ManagerId,
    pub token: Weak<ManagerToken>,
    pub events: mpsc::UnboundedSender<CentralEvent>,
    pub scan: Option<ScanSession>,
    pub projections: HashMap<PeripheralId, Projection>,
}

impl ManagerRecord {
    pub fn is_alive(&self) -> bool {
        self.token.strong_count() > 0
    }

    pub fn emit(&self, event: CentralEvent) {
        // A closed queue only means nobody listens any more.
        let _ = self.events.send(event);
    }
}

/// A pending completion: which projection it targets and the state that
/// projection must still be in when the completion fires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Guard {
    pub manager: ManagerId,
    pub peripheral: PeripheralId,
    pub expected: ConnectionState,
    pub generation: u64,
    pub epoch: u64,
}

/// A projection whose guard still holds, with its peripheral.
pub(crate) struct Target<'a> {
    pub events: &'a mpsc::UnboundedSender<CentralEvent>,
    pub projection: &'a mut Projection,
    pub peripheral: &'a mut PeripheralState,
    pub rng: &'a mut StdRng,
}

impl Target<'_> {
    pub fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }
}

pub(crate) struct World {
    pub state: ManagerState,
    pub authorization: Option<Authorization>,
    /// Advanced whenever the adapter leaves `PoweredOn` or the simulation
    /// is torn down, invalidating every pending completion at once.
    pub epoch: u64,
    pub peripherals: Vec<PeripheralState>,
    pub managers: Vec<ManagerRecord>,
    pub rng: StdRng,
    next_key: u64,
    next_manager: u64,
}

impl World {
    pub fn new(config: &SimulationConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: config.initial_state,
            authorization: None,
            epoch: 0,
            peripherals: Vec::new(),
            managers: Vec::new(),
            rng,
            next_key: 0,
            next_manager: 0,
        }
    }

    pub fn next_key(&mut self) -> PeripheralKey {
        self.next_key += 1;
        PeripheralKey(self.next_key)
    }

    pub fn next_manager_id(&mut self) -> ManagerId {
        self.next_manager += 1;
        ManagerId(self.next_manager)
    }

    /// Drop registrations of managers nobody references any more. Their
    /// links are released from the shared counters; the behaviors of the
    /// peripherals they held are returned so the caller can notify them
    /// once the lock is released.
    #[must_use]
    pub fn sweep(&mut self) -> Vec<Arc<dyn PeripheralBehavior>> {
        let Self {
            managers,
            peripherals,
            ..
        } = self;
        let mut released = Vec::new();
        managers.retain(|manager| {
            if manager.is_alive() {
                return true;
            }
            log::debug!("sweeping released central manager {:?}", manager.id);
            for (id, projection) in &manager.projections {
                if !projection.holds_link {
                    continue;
                }
                if let Some(p) = peripherals.iter_mut().find(|p| p.id() == *id) {
                    p.virtual_connections = p.virtual_connections.saturating_sub(1);
                    released.push(p.behavior());
                }
            }
            false
        });
        released
    }

    /// Forget that any manager holds a link to `id`.
    pub fn sever_links(&mut self, id: &PeripheralId) {
        for manager in self.managers.iter_mut() {
            if let Some(projection) = manager.projections.get_mut(id) {
                projection.holds_link = false;
            }
        }
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<&PeripheralState> {
        self.peripherals.iter().find(|p| p.id() == *id)
    }

    pub fn peripheral_mut(&mut self, id: &PeripheralId) -> Option<&mut PeripheralState> {
        self.peripherals.iter_mut().find(|p| p.id() == *id)
    }

    pub fn identifier_of(&self, key: PeripheralKey) -> Option<PeripheralId> {
        self.peripherals.iter().find(|p| p.key == key).map(|p| p.id())
    }

    pub fn manager(&self, id: ManagerId) -> Option<&ManagerRecord> {
        self.managers.iter().find(|m| m.id == id && m.is_alive())
    }

    pub fn manager_mut(&mut self, id: ManagerId) -> Option<&mut ManagerRecord> {
        self.managers.iter_mut().find(|m| m.id == id && m.is_alive())
    }

    pub fn projection_mut(
        &mut self,
        manager: ManagerId,
        peripheral: &PeripheralId,
    ) -> Option<&mut Projection> {
        self.manager_mut(manager)?.projections.get_mut(peripheral)
    }

    /// Get or create a manager's projection of a known peripheral.
    pub fn ensure_projection(
        &mut self,
        manager: ManagerId,
        peripheral: &PeripheralId,
        default_mtu: usize,
    ) -> Option<&mut Projection> {
        let p = self.peripheral(peripheral)?;
        let name = p.spec.name.clone();
        let mtu = p.spec.mtu.unwrap_or(default_mtu);
        let record = self.manager_mut(manager)?;
        Some(
            record
                .projections
                .entry(*peripheral)
                .or_insert_with(|| Projection::new(name, mtu)),
        )
    }

    /// Snapshot the guard of a projection's current state.
    pub fn guard(&self, manager: ManagerId, peripheral: &PeripheralId) -> Option<Guard> {
        let projection = self.manager(manager)?.projections.get(peripheral)?;
        Some(Guard {
            manager,
            peripheral: *peripheral,
            expected: projection.state,
            generation: projection.generation,
            epoch: self.epoch,
        })
    }

    /// Re-validate a pending completion. `None` means it was superseded.
    pub fn resolve(&mut self, guard: &Guard) -> Option<Target<'_>> {
        if guard.epoch != self.epoch || self.state != ManagerState::PoweredOn {
            return None;
        }
        let Self {
            managers,
            peripherals,
            rng,
            ..
        } = self;
        let ManagerRecord {
            events,
            projections,
            token,
            ..
        } = managers.iter_mut().find(|m| m.id == guard.manager)?;
        if token.strong_count() == 0 {
            return None;
        }
        let projection = projections.get_mut(&guard.peripheral)?;
        if projection.state != guard.expected || projection.generation != guard.generation {
            return None;
        }
        let peripheral = peripherals.iter_mut().find(|p| p.id() == guard.peripheral)?;
        Some(Target {
            events,
            projection,
            peripheral,
            rng,
        })
    }
}

/// RSSI for a proximity band with uniform jitter of up to `deviation` dBm.
pub(crate) fn jitter_rssi(rng: &mut StdRng, proximity: Proximity, deviation: i16) -> i16 {
    if !proximity.is_in_range() || deviation <= 0 {
        return proximity.rssi();
    }
    proximity.rssi() + rng.gen_range(-deviation..=deviation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_with_manager() -> (World, ManagerId, Arc<ManagerToken>) {
        let mut world = World::new(&SimulationConfig {
            rng_seed: Some(1),
            initial_state: ManagerState::PoweredOn,
            ..SimulationConfig::default()
        });
        let token = Arc::new(ManagerToken);
        let (events, _rx) = mpsc::unbounded_channel();
        let id = world.next_manager_id();
        world.managers.push(ManagerRecord {
            id,
            token: Arc::downgrade(&token),
            events,
            scan: None,
            projections: HashMap::new(),
        });
        (world, id, token)
    }

    fn add_peripheral(world: &mut World) -> PeripheralId {
        let spec = PeripheralSpec::simulate_peripheral(PeripheralId::new(), Proximity::Near)
            .connectable(
                "Test",
                Vec::new(),
                Arc::new(AcceptAll),
                std::time::Duration::from_millis(45),
                23,
            )
            .build();
        let id = spec.identifier;
        let key = world.next_key();
        world.peripherals.push(PeripheralState::new(key, spec));
        id
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let rssi = jitter_rssi(&mut rng, Proximity::Near, 15);
            assert!((-55..=-25).contains(&rssi), "{rssi} outside near band");
        }
        assert_eq!(jitter_rssi(&mut rng, Proximity::OutOfRange, 15), 127);
    }

    #[test]
    fn test_guard_is_superseded_by_transition() {
        let (mut world, manager, _token) = world_with_manager();
        let id = add_peripheral(&mut world);
        world.ensure_projection(manager, &id, 23).unwrap();

        let guard = world.guard(manager, &id).unwrap();
        assert!(world.resolve(&guard).is_some());

        world
            .projection_mut(manager, &id)
            .unwrap()
            .transition(ConnectionState::Connecting);
        assert!(world.resolve(&guard).is_none());

        // Same state again, but a different generation.
        world
            .projection_mut(manager, &id)
            .unwrap()
            .transition(ConnectionState::Disconnected);
        assert!(world.resolve(&guard).is_none());
    }

    #[test]
    fn test_guard_is_superseded_by_epoch() {
        let (mut world, manager, _token) = world_with_manager();
        let id = add_peripheral(&mut world);
        world.ensure_projection(manager, &id, 23).unwrap();
        let guard = world.guard(manager, &id).unwrap();
        world.epoch += 1;
        assert!(world.resolve(&guard).is_none());
    }

    #[test]
    fn test_sweep_releases_connections() {
        let (mut world, manager, token) = world_with_manager();
        let id = add_peripheral(&mut world);
        let projection = world.ensure_projection(manager, &id, 23).unwrap();
        projection.transition(ConnectionState::Connected);
        projection.holds_link = true;
        world.peripheral_mut(&id).unwrap().virtual_connections = 1;

        assert!(world.sweep().is_empty());
        assert_eq!(world.managers.len(), 1);

        drop(token);
        assert_eq!(world.sweep().len(), 1);
        assert!(world.managers.is_empty());
        assert!(!world.peripheral(&id).unwrap().is_connected());
    }

    #[test]
    fn test_sweep_skips_severed_links() {
        let (mut world, manager, token) = world_with_manager();
        let id = add_peripheral(&mut world);
        let projection = world.ensure_projection(manager, &id, 23).unwrap();
        projection.transition(ConnectionState::Connected);
        projection.holds_link = true;

        // The link was lost, then another app connected.
        world.sever_links(&id);
        world.peripheral_mut(&id).unwrap().virtual_connections = 1;

        drop(token);
        assert!(world.sweep().is_empty());
        assert_eq!(world.peripheral(&id).unwrap().virtual_connections, 1);
    }
}
