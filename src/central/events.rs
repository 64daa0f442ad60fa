//! Events delivered to a central manager
//!
//! Each manager owns one unbounded queue. Results are pushed onto it from
//! timer tasks, so one manager's slow consumer never delays another's.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::ble::advertisement::AdvertisementData;
use crate::ble::gatt::{Characteristic, Descriptor, Service};
use crate::ble::types::{ManagerState, PeripheralId};
use crate::ble::BleError;

#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The adapter changed power state. Always the first event of a manager.
    StateChanged(ManagerState),

    /// A scanning manager received an advertisement.
    Discovered {
        peripheral: PeripheralId,
        advertisement: AdvertisementData,
        rssi: i16,
    },

    Connected(PeripheralId),

    FailedToConnect {
        peripheral: PeripheralId,
        error: BleError,
    },

    Disconnected {
        peripheral: PeripheralId,
        timestamp: DateTime<Utc>,
        /// Auto-reconnect is not simulated, so this is always `false`.
        is_reconnecting: bool,
        error: Option<BleError>,
    },

    /// The peripheral's services changed; these were removed from the
    /// manager's view and must be rediscovered if still needed.
    ServicesInvalidated {
        peripheral: PeripheralId,
        services: Vec<Service>,
    },

    NameChanged {
        peripheral: PeripheralId,
        name: Option<String>,
    },

    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<(), BleError>,
    },

    IncludedServicesDiscovered {
        peripheral: PeripheralId,
        service: Service,
        result: Result<(), BleError>,
    },

    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Service,
        result: Result<(), BleError>,
    },

    DescriptorsDiscovered {
        peripheral: PeripheralId,
        characteristic: Characteristic,
        result: Result<(), BleError>,
    },

    /// A read completed or a notification/indication arrived.
    CharacteristicValueUpdated {
        peripheral: PeripheralId,
        characteristic: Characteristic,
        result: Result<Bytes, BleError>,
    },

    DescriptorValueUpdated {
        peripheral: PeripheralId,
        descriptor: Descriptor,
        result: Result<Bytes, BleError>,
    },

    CharacteristicValueWritten {
        peripheral: PeripheralId,
        characteristic: Characteristic,
        result: Result<(), BleError>,
    },

    DescriptorValueWritten {
        peripheral: PeripheralId,
        descriptor: Descriptor,
        result: Result<(), BleError>,
    },

    NotificationStateChanged {
        peripheral: PeripheralId,
        characteristic: Characteristic,
        result: Result<(), BleError>,
    },

    /// Write-without-response credits became available again.
    ReadyToSendWithoutResponse(PeripheralId),

    RssiRead {
        peripheral: PeripheralId,
        result: Result<i16, BleError>,
    },
}

impl CentralEvent {
    /// The peripheral this event concerns, if any.
    pub fn peripheral(&self) -> Option<PeripheralId> {
        use CentralEvent::*;
        match self {
            StateChanged(_) => None,
            Connected(p) | ReadyToSendWithoutResponse(p) => Some(*p),
            Discovered { peripheral, .. }
            | FailedToConnect { peripheral, .. }
            | Disconnected { peripheral, .. }
            | ServicesInvalidated { peripheral, .. }
            | NameChanged { peripheral, .. }
            | ServicesDiscovered { peripheral, .. }
            | IncludedServicesDiscovered { peripheral, .. }
            | CharacteristicsDiscovered { peripheral, .. }
            | DescriptorsDiscovered { peripheral, .. }
            | CharacteristicValueUpdated { peripheral, .. }
            | DescriptorValueUpdated { peripheral, .. }
            | CharacteristicValueWritten { peripheral, .. }
            | DescriptorValueWritten { peripheral, .. }
            | NotificationStateChanged { peripheral, .. }
            | RssiRead { peripheral, .. } => Some(*peripheral),
        }
    }

    pub(crate) fn disconnected(peripheral: PeripheralId, error: Option<BleError>) -> Self {
        CentralEvent::Disconnected {
            peripheral,
            timestamp: Utc::now(),
            is_reconnecting: false,
            error,
        }
    }
}

/// Receiving end of a manager's event queue.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<CentralEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<CentralEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. Returns `None` once the simulation dropped
    /// the manager's registration (teardown) and the queue is drained.
    pub async fn recv(&mut self) -> Option<CentralEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<CentralEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every event delivered so far.
    pub fn drain(&mut self) -> Vec<CentralEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Stream for EventStream {
    type Item = CentralEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
