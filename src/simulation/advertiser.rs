//! Advertising timers
//!
//! Every advertisement config of a peripheral runs as its own tokio task.
//! Tasks only hold a weak reference to the simulation and are aborted when
//! the peripheral's advertisement set is replaced or the simulation is
//! torn down.

use std::sync::{Arc, Weak};

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::ble::advertisement::AdvertisementConfig;
use crate::ble::types::{ConnectionState, ManagerState};
use crate::central::events::CentralEvent;

use super::registry::{jitter_rssi, ManagerRecord, PeripheralKey, PeripheralState, Projection, World};
use super::SimInner;

impl SimInner {
    /// (Re)start the advertising timers of `peripheral`. Delays count from now.
    pub(crate) fn start_advertising(self: &Arc<Self>, peripheral: &mut PeripheralState) {
        peripheral.stop_advertising();
        let key = peripheral.key;
        for config in &peripheral.spec.advertisements {
            if config.is_inert() {
                continue;
            }
            let task = tokio::spawn(run(Arc::downgrade(self), key, config.clone()));
            peripheral.advertising.push(task.abort_handle());
        }
    }

    /// Broadcast one advertisement packet to every scanning manager.
    fn advertise(self: &Arc<Self>, key: PeripheralKey, config: &AdvertisementConfig) {
        let (id, pending) = {
            self.sweep();
            let mut world = self.world();
            if world.state != ManagerState::PoweredOn {
                return;
            }
            let World {
                peripherals,
                managers,
                rng,
                ..
            } = &mut *world;
            let Some(peripheral) = peripherals.iter_mut().find(|p| p.key == key) else {
                return;
            };
            let proximity = peripheral.spec.proximity;
            if !proximity.is_in_range() {
                return;
            }
            if peripheral.is_connected() && !config.also_when_connected {
                return;
            }
            peripheral.known = true;

            let id = peripheral.id();
            let mtu = peripheral.spec.mtu.unwrap_or(self.config.default_mtu);
            let mut pending = Vec::new();
            for manager in managers.iter_mut() {
                let ManagerRecord {
                    id: manager_id,
                    scan,
                    projections,
                    events,
                    ..
                } = manager;

                if let Some(scan) = scan {
                    if config.data.matches_filter(scan.filter.as_deref()) {
                        let projection = projections
                            .entry(id)
                            .or_insert_with(|| Projection::new(peripheral.spec.name.clone(), mtu));
                        if let Some(name) = &config.data.local_name {
                            projection.name = Some(name.clone());
                        }
                        if !projection.reported || scan.allow_duplicates {
                            projection.reported = true;
                            let _ = events.send(CentralEvent::Discovered {
                                peripheral: id,
                                advertisement: config.data.clone(),
                                rssi: jitter_rssi(rng, proximity, self.config.rssi_deviation),
                            });
                        }
                    }
                }

                if config.data.is_connectable {
                    let waiting = projections.get(&id).map_or(false, |p| {
                        p.state == ConnectionState::Connecting && !p.connect_in_flight
                    });
                    if waiting {
                        pending.push(*manager_id);
                    }
                }
            }
            (id, pending)
        };

        for manager in pending {
            self.try_connect(manager, id);
        }
    }
}

async fn run(sim: Weak<SimInner>, key: PeripheralKey, config: AdvertisementConfig) {
    let start = Instant::now();
    let first_tick = if config.delay.is_zero() {
        start
    } else {
        time::sleep_until(start + config.delay).await;
        if !fire(&sim, key, &config) || config.interval.is_zero() {
            return;
        }
        start + config.delay + config.interval
    };

    let mut ticker = time::interval_at(first_tick, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !fire(&sim, key, &config) {
            return;
        }
    }
}

/// Returns `false` once the simulation is gone.
fn fire(sim: &Weak<SimInner>, key: PeripheralKey, config: &AdvertisementConfig) -> bool {
    match sim.upgrade() {
        Some(sim) => {
            sim.advertise(key, config);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::ble::advertisement::AdvertisementData;
    use crate::ble::types::{PeripheralId, Proximity};
    use crate::central::{CentralEvent, CentralManager, ScanOptions};
    use crate::config::SimulationConfig;
    use crate::simulation::behavior::AcceptAll;
    use crate::simulation::spec::PeripheralSpec;
    use crate::simulation::Simulation;

    fn discoveries(events: &mut crate::central::EventStream) -> usize {
        events
            .drain()
            .iter()
            .filter(|e| matches!(e, CentralEvent::Discovered { .. }))
            .count()
    }

    fn names(events: &mut crate::central::EventStream) -> Vec<String> {
        events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                CentralEvent::Discovered { advertisement, .. } => advertisement.local_name,
                _ => None,
            })
            .collect()
    }

    fn powered_sim() -> Simulation {
        Simulation::new(SimulationConfig {
            rng_seed: Some(7),
            ..SimulationConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_advertisement_fires_once_then_repeats() {
        let sim = powered_sim();
        let id = PeripheralId::new();
        sim.set_peripherals(vec![PeripheralSpec::simulate_peripheral(id, Proximity::Near)
            .advertising(
                AdvertisementData::named("Late"),
                Duration::from_secs(1),
                Duration::from_millis(500),
                false,
            )
            .build()]);
        sim.power_on();
        let (manager, mut events) = CentralManager::new(&sim);
        manager.scan_for_peripherals(None, ScanOptions { allow_duplicates: true });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(discoveries(&mut events), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(discoveries(&mut events), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(discoveries(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_filtered_per_scan_session() {
        let sim = powered_sim();
        let id = PeripheralId::new();
        sim.set_peripherals(vec![PeripheralSpec::simulate_peripheral(id, Proximity::Far)
            .advertising(
                AdvertisementData::named("Chatty"),
                Duration::from_millis(100),
                Duration::ZERO,
                false,
            )
            .build()]);
        sim.power_on();
        let (manager, mut events) = CentralManager::new(&sim);

        manager.scan_for_peripherals(None, ScanOptions::default());
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(discoveries(&mut events), 1);

        // A fresh scan session reports the peripheral again.
        manager.scan_for_peripherals(None, ScanOptions::default());
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(discoveries(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filter_matches_advertised_services() {
        let heart_rate = crate::ble::gatt::uuid_from_u16(0x180D);
        let battery = crate::ble::gatt::uuid_from_u16(0x180F);
        let sim = powered_sim();
        sim.set_peripherals(vec![PeripheralSpec::simulate_peripheral(
            PeripheralId::new(),
            Proximity::Immediate,
        )
        .advertising(
            AdvertisementData::named("Strap").with_services([heart_rate]),
            Duration::from_millis(100),
            Duration::ZERO,
            false,
        )
        .build()]);
        sim.power_on();

        let (battery_only, mut battery_events) = CentralManager::new(&sim);
        let (heart_only, mut heart_events) = CentralManager::new(&sim);
        battery_only.scan_for_peripherals(Some(vec![battery]), ScanOptions::default());
        heart_only.scan_for_peripherals(Some(vec![heart_rate]), ScanOptions::default());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(discoveries(&mut battery_events), 0);
        assert_eq!(discoveries(&mut heart_events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_advertisements_restart_timers() {
        let sim = powered_sim();
        let id = PeripheralId::new();
        sim.set_peripherals(vec![PeripheralSpec::simulate_peripheral(id, Proximity::Near)
            .advertising(
                AdvertisementData::named("Old"),
                Duration::from_millis(100),
                Duration::ZERO,
                false,
            )
            .build()]);
        sim.power_on();
        let (manager, mut events) = CentralManager::new(&sim);
        manager.scan_for_peripherals(None, ScanOptions { allow_duplicates: true });
        tokio::time::sleep(Duration::from_millis(50)).await;
        events.drain();

        sim.simulate_advertisement_change(
            &id,
            vec![crate::ble::advertisement::AdvertisementConfig::new(
                AdvertisementData::named("New"),
                Duration::ZERO,
                Duration::from_secs(2),
                false,
            )],
        );

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(discoveries(&mut events), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(names(&mut events), vec!["New".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_flagged_advertisements_continue_while_connected() {
        let sim = powered_sim();
        let id = PeripheralId::new();
        sim.set_peripherals(vec![PeripheralSpec::simulate_peripheral(id, Proximity::Near)
            .advertising(
                AdvertisementData::named("Pairing"),
                Duration::from_millis(100),
                Duration::ZERO,
                false,
            )
            .advertising(
                AdvertisementData::named("Beacon"),
                Duration::from_millis(100),
                Duration::ZERO,
                true,
            )
            .connectable(
                "Tracker",
                Vec::new(),
                std::sync::Arc::new(AcceptAll),
                Duration::from_millis(30),
                23,
            )
            .connected()
            .build()]);
        sim.power_on();
        let (manager, mut events) = CentralManager::new(&sim);
        manager.scan_for_peripherals(None, ScanOptions { allow_duplicates: true });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let heard = names(&mut events);
        assert!(!heard.is_empty());
        assert!(heard.iter().all(|name| name == "Beacon"), "heard {heard:?}");

        // Once the other application lets go, both packets are broadcast.
        sim.simulate_disconnection(&id, None);
        tokio::time::sleep(Duration::from_millis(350)).await;
        let heard = names(&mut events);
        assert!(heard.iter().any(|name| name == "Pairing"), "heard {heard:?}");
        assert!(heard.iter().any(|name| name == "Beacon"), "heard {heard:?}");
    }
}
