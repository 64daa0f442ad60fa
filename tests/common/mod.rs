//! Shared fixtures for the simulation integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_sim::ble::gatt::uuid_from_u16 as uuid;
use ble_sim::{
    AcceptAll, AdvertisementData, AttributeGraph, BleError, CentralEvent, CentralManager,
    Characteristic, CharacteristicProperties, CharacteristicSpec, DescriptorSpec, EventStream,
    Peripheral, PeripheralBehavior, PeripheralId, PeripheralSpec, PeripheralSpecBuilder,
    Proximity, ScanOptions, ServiceId, ServiceSpec, SimulatedPeripheral, Simulation,
    SimulationConfig,
};
use bytes::Bytes;

pub const HEART_RATE: u16 = 0x180D;
pub const MEASUREMENT: u16 = 0x2A37;
pub const BODY_LOCATION: u16 = 0x2A38;
pub const CONTROL_POINT: u16 = 0x2A39;
pub const BATTERY: u16 = 0x180F;
pub const BATTERY_LEVEL: u16 = 0x2A19;
pub const USER_DESCRIPTION: u16 = 0x2901;

pub const CONNECTION_INTERVAL: Duration = Duration::from_millis(45);
pub const MTU: usize = 23;

// ---------------------------------------------------------------------------
// Behavior that records what the central asked for
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Recorder {
    pub reject_connections: AtomicBool,
    pub push_on_subscribe: AtomicBool,
    pub connect_requests: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub write_commands: AtomicUsize,
    pub notify_requests: AtomicUsize,
    pub notify_confirmations: AtomicUsize,
    pub resets: AtomicUsize,
    handle: Mutex<Option<SimulatedPeripheral>>,
}

impl Recorder {
    pub fn handle(&self) -> Option<SimulatedPeripheral> {
        self.handle.lock().unwrap().clone()
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

impl PeripheralBehavior for Recorder {
    fn on_attach(&self, peripheral: SimulatedPeripheral) {
        *self.handle.lock().unwrap() = Some(peripheral);
    }

    fn on_connect_request(&self) -> Result<(), BleError> {
        self.connect_requests.fetch_add(1, Ordering::SeqCst);
        if self.reject_connections.load(Ordering::SeqCst) {
            return Err(BleError::ConnectionFailed("rejected by peripheral".into()));
        }
        Ok(())
    }

    fn on_disconnect(&self, _error: Option<&BleError>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_write_command(&self, _characteristic: &Characteristic, _data: &Bytes) {
        self.write_commands.fetch_add(1, Ordering::SeqCst);
    }

    fn on_set_notify(&self, enabled: bool, characteristic: &Characteristic) -> Result<(), BleError> {
        self.notify_requests.fetch_add(1, Ordering::SeqCst);
        AcceptAll.on_set_notify(enabled, characteristic)
    }

    fn on_notify_state_changed(&self, characteristic: &Characteristic) {
        self.notify_confirmations.fetch_add(1, Ordering::SeqCst);
        if characteristic.is_notifying() && self.push_on_subscribe.load(Ordering::SeqCst) {
            if let Some(handle) = self.handle() {
                handle.simulate_value_update(characteristic.id(), vec![0x42]);
            }
        }
    }

    fn on_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn simulation() -> Simulation {
    init_logging();
    Simulation::new(SimulationConfig {
        rng_seed: Some(42),
        ..SimulationConfig::default()
    })
}

pub fn sensor_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::new(uuid(HEART_RATE))
            .characteristic(
                CharacteristicSpec::new(uuid(MEASUREMENT), CharacteristicProperties::NOTIFY)
                    .descriptor(DescriptorSpec::new(uuid(USER_DESCRIPTION)).value("Heart rate")),
            )
            .characteristic(
                CharacteristicSpec::new(uuid(BODY_LOCATION), CharacteristicProperties::READ)
                    .value(vec![1]),
            )
            .characteristic(CharacteristicSpec::new(
                uuid(CONTROL_POINT),
                CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            )),
        ServiceSpec::new(uuid(BATTERY)).characteristic(
            CharacteristicSpec::new(
                uuid(BATTERY_LEVEL),
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .value(vec![100]),
        ),
    ]
}

/// A connectable heart rate sensor advertising every 100 ms.
pub fn sensor_builder(
    id: PeripheralId,
    proximity: Proximity,
    behavior: Arc<Recorder>,
) -> PeripheralSpecBuilder {
    PeripheralSpec::simulate_peripheral(id, proximity)
        .advertising(
            AdvertisementData::named("Test").with_services([uuid(HEART_RATE)]),
            Duration::from_millis(100),
            Duration::ZERO,
            false,
        )
        .connectable("Sensor", sensor_services(), behavior, CONNECTION_INTERVAL, MTU)
}

pub fn sensor(id: PeripheralId, proximity: Proximity, behavior: Arc<Recorder>) -> PeripheralSpec {
    sensor_builder(id, proximity, behavior).build()
}

/// A powered simulation with one sensor near by.
pub fn sensor_world() -> (Simulation, PeripheralId, Arc<Recorder>) {
    let sim = simulation();
    let id = PeripheralId::new();
    let behavior = Arc::new(Recorder::default());
    sim.set_peripherals(vec![sensor(id, Proximity::Near, behavior.clone())]);
    sim.power_on();
    (sim, id, behavior)
}

// ---------------------------------------------------------------------------
// Driving a central
// ---------------------------------------------------------------------------

/// Wait for the first event matching `matches`, skipping everything else.
pub async fn expect_event(
    events: &mut EventStream,
    what: &str,
    matches: impl Fn(&CentralEvent) -> bool,
) -> CentralEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Let `duration` of simulated time pass and return what arrived meanwhile.
pub async fn events_during(events: &mut EventStream, duration: Duration) -> Vec<CentralEvent> {
    tokio::time::sleep(duration).await;
    events.drain()
}

/// Connect to `id`, scanning for it first unless it can be retrieved.
/// Connected peripherals stop advertising, so scanning would never find them.
pub async fn connect(
    manager: &CentralManager,
    events: &mut EventStream,
    id: PeripheralId,
) -> Peripheral {
    if manager.retrieve_peripherals(&[id]).is_empty() {
        manager.scan_for_peripherals(None, ScanOptions::default());
        expect_event(events, "discovery", |e| {
            matches!(e, CentralEvent::Discovered { peripheral, .. } if *peripheral == id)
        })
        .await;
        manager.stop_scan();
    }
    manager.connect(&id);
    expect_event(events, "connection", |e| *e == CentralEvent::Connected(id)).await;
    manager.peripheral(&id).expect("connected peripheral has a handle")
}

/// Discover every service and characteristic.
pub async fn discover_all(peripheral: &Peripheral, events: &mut EventStream) -> AttributeGraph {
    peripheral.discover_services(None);
    expect_event(events, "services", |e| {
        matches!(e, CentralEvent::ServicesDiscovered { result: Ok(()), .. })
    })
    .await;
    let services: Vec<ServiceId> = peripheral
        .attributes()
        .services()
        .expect("services discovered")
        .iter()
        .map(|s| s.id())
        .collect();
    for service in services {
        peripheral.discover_characteristics(service, None);
        expect_event(events, "characteristics", |e| {
            matches!(e, CentralEvent::CharacteristicsDiscovered { service: s, .. } if s.id() == service)
        })
        .await;
    }
    peripheral.attributes()
}

pub fn characteristic_id(graph: &AttributeGraph, short: u16) -> ble_sim::CharacteristicId {
    graph
        .find_characteristic(uuid(short))
        .unwrap_or_else(|| panic!("characteristic {short:#06x} not known"))
        .id()
}
