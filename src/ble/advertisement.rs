//! Advertisement payloads and broadcast schedules

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

/// Decoded contents of one advertising packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvertisementData {
    /// Complete or shortened local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs, matched against scan filters.
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Option<Bytes>,
    pub service_data: HashMap<Uuid, Bytes>,
    pub tx_power_level: Option<i16>,
    /// Whether a central receiving this packet may connect.
    pub is_connectable: bool,
}

impl AdvertisementData {
    /// A connectable advertisement carrying only a local name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            local_name: Some(name.into()),
            is_connectable: true,
            ..Self::default()
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.service_uuids.extend(services);
        self
    }

    /// Whether this advertisement passes a scan filter. An absent or empty
    /// filter accepts everything.
    pub fn matches_filter(&self, filter: Option<&[Uuid]>) -> bool {
        match filter {
            None => true,
            Some(uuids) if uuids.is_empty() => true,
            Some(uuids) => uuids.iter().any(|u| self.service_uuids.contains(u)),
        }
    }
}

/// One recurring advertisement of a peripheral.
///
/// A peripheral may hold several at once to simulate multi-packet
/// advertising. If `delay` is non-zero the packet is sent once after
/// `delay`, then every `interval`; with a zero delay it is sent every
/// `interval` starting immediately. Both zero means the config is inert.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementConfig {
    pub data: AdvertisementData,
    pub interval: Duration,
    pub delay: Duration,
    pub also_when_connected: bool,
}

impl AdvertisementConfig {
    pub fn new(
        data: AdvertisementData,
        interval: Duration,
        delay: Duration,
        also_when_connected: bool,
    ) -> Self {
        Self {
            data,
            interval,
            delay,
            also_when_connected,
        }
    }

    /// Whether this config never fires.
    pub fn is_inert(&self) -> bool {
        self.interval.is_zero() && self.delay.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let hrs = Uuid::from_u128(0x180D);
        let bas = Uuid::from_u128(0x180F);
        let data = AdvertisementData::named("Sensor").with_services([hrs]);

        assert!(data.matches_filter(None));
        assert!(data.matches_filter(Some(&[])));
        assert!(data.matches_filter(Some(&[bas, hrs])));
        assert!(!data.matches_filter(Some(&[bas])));
    }

    #[test]
    fn test_inert_config() {
        let inert = AdvertisementConfig::new(
            AdvertisementData::default(),
            Duration::ZERO,
            Duration::ZERO,
            true,
        );
        assert!(inert.is_inert());

        let one_shot = AdvertisementConfig::new(
            AdvertisementData::default(),
            Duration::ZERO,
            Duration::from_secs(1),
            true,
        );
        assert!(!one_shot.is_inert());
    }
}
