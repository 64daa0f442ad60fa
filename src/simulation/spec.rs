//! Builder-style description of a simulated peripheral

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ble::advertisement::{AdvertisementConfig, AdvertisementData};
use crate::ble::gatt::{AttributeGraph, ServiceSpec};
use crate::ble::types::{PeripheralId, Proximity};

use super::behavior::PeripheralBehavior;

/// Everything the simulation knows about one peripheral.
///
/// Created with [`PeripheralSpec::simulate_peripheral`] and handed to
/// [`crate::simulation::Simulation::set_peripherals`].
pub struct PeripheralSpec {
    pub(crate) identifier: PeripheralId,
    pub(crate) name: Option<String>,
    pub(crate) proximity: Proximity,
    pub(crate) advertisements: Vec<AdvertisementConfig>,
    pub(crate) services: AttributeGraph,
    pub(crate) connection_interval: Option<Duration>,
    pub(crate) mtu: Option<usize>,
    pub(crate) behavior: Option<Arc<dyn PeripheralBehavior>>,
    pub(crate) initially_connected: bool,
    pub(crate) allow_retrieval: bool,
}

impl PeripheralSpec {
    /// Start describing a peripheral. It neither advertises nor accepts
    /// connections until configured to.
    pub fn simulate_peripheral(
        identifier: impl Into<PeripheralId>,
        proximity: Proximity,
    ) -> PeripheralSpecBuilder {
        PeripheralSpecBuilder {
            spec: PeripheralSpec {
                identifier: identifier.into(),
                name: None,
                proximity,
                advertisements: Vec::new(),
                services: AttributeGraph::from_specs(Vec::new()),
                connection_interval: None,
                mtu: None,
                behavior: None,
                initially_connected: false,
                allow_retrieval: false,
            },
        }
    }

    /// Address the peripheral is registered under.
    pub fn identifier(&self) -> PeripheralId {
        self.identifier
    }

    /// Advertised local name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Initial distance from the adapter.
    pub fn proximity(&self) -> Proximity {
        self.proximity
    }

    /// Advertisement configurations, in the order they were added.
    pub fn advertisements(&self) -> &[AdvertisementConfig] {
        &self.advertisements
    }

    /// The canonical attribute tree.
    pub fn services(&self) -> &AttributeGraph {
        &self.services
    }

    /// Connectable peripherals have both a behavior and a connection interval.
    pub fn is_connectable(&self) -> bool {
        self.behavior.is_some() && self.connection_interval.is_some()
    }
}

impl fmt::Debug for PeripheralSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralSpec")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("proximity", &self.proximity)
            .field("advertisements", &self.advertisements.len())
            .field("connection_interval", &self.connection_interval)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

pub struct PeripheralSpecBuilder {
    spec: PeripheralSpec,
}

impl PeripheralSpecBuilder {
    /// Broadcast `data` on a schedule. May be called several times to
    /// simulate multi-packet advertising.
    pub fn advertising(
        self,
        data: AdvertisementData,
        interval: Duration,
        delay: Duration,
        also_when_connected: bool,
    ) -> Self {
        self.advertisement(AdvertisementConfig::new(
            data,
            interval,
            delay,
            also_when_connected,
        ))
    }

    pub fn advertisement(mut self, config: AdvertisementConfig) -> Self {
        self.spec.advertisements.push(config);
        self
    }

    /// Make the peripheral connectable. `behavior` decides the outcome of
    /// every request a central sends.
    pub fn connectable(
        mut self,
        name: impl Into<String>,
        services: Vec<ServiceSpec>,
        behavior: Arc<dyn PeripheralBehavior>,
        connection_interval: Duration,
        mtu: usize,
    ) -> Self {
        self.spec.name = Some(name.into());
        self.spec.services = AttributeGraph::from_specs(services);
        self.spec.behavior = Some(behavior);
        self.spec.connection_interval = Some(connection_interval);
        self.spec.mtu = Some(mtu);
        self
    }

    /// Start with one connection held by another application.
    pub fn connected(mut self) -> Self {
        self.spec.initially_connected = true;
        self.spec.allow_retrieval = true;
        self
    }

    /// Allow retrieval by identifier without scanning first.
    pub fn allow_for_retrieval(mut self) -> Self {
        self.spec.allow_retrieval = true;
        self
    }

    pub fn build(self) -> PeripheralSpec {
        if self.spec.initially_connected && !self.spec.is_connectable() {
            log::warn!(
                "peripheral {} is marked connected but is not connectable",
                self.spec.identifier
            );
        }
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{uuid_from_u16, CharacteristicProperties, CharacteristicSpec};
    use crate::simulation::behavior::AcceptAll;

    #[test]
    fn test_builder_collects_everything() {
        let id = PeripheralId::new();
        let spec = PeripheralSpec::simulate_peripheral(id, Proximity::Far)
            .advertising(
                AdvertisementData::named("Thermo"),
                Duration::from_millis(100),
                Duration::ZERO,
                false,
            )
            .advertising(
                AdvertisementData::default(),
                Duration::from_secs(1),
                Duration::from_millis(500),
                true,
            )
            .connectable(
                "Thermometer",
                vec![ServiceSpec::new(uuid_from_u16(0x1809)).characteristic(
                    CharacteristicSpec::new(
                        uuid_from_u16(0x2A1C),
                        CharacteristicProperties::INDICATE,
                    ),
                )],
                Arc::new(AcceptAll),
                Duration::from_millis(45),
                185,
            )
            .allow_for_retrieval()
            .build();

        assert_eq!(spec.identifier(), id);
        assert_eq!(spec.name(), Some("Thermometer"));
        assert_eq!(spec.advertisements().len(), 2);
        assert!(spec.is_connectable());
        assert!(spec.allow_retrieval);
        assert_eq!(spec.services().services().unwrap().len(), 1);
    }

    #[test]
    fn test_advertise_only_peripheral() {
        let spec = PeripheralSpec::simulate_peripheral(PeripheralId::new(), Proximity::Near)
            .advertising(
                AdvertisementData::named("Beacon"),
                Duration::from_millis(100),
                Duration::ZERO,
                false,
            )
            .build();
        assert!(!spec.is_connectable());
        assert!(spec.services().services().unwrap().is_empty());
        assert!(format!("{spec:?}").contains("PeripheralSpec"));
    }
}
