//! GATT attribute graph
//!
//! Services, characteristics and descriptors live in per-kind node tables
//! keyed by stable handles. Children refer to their parent by handle rather
//! than by reference, so a graph can be cloned (deep copy) or projected
//! into an independently discoverable view without ownership cycles.
//!
//! A child list of `None` means "not discovered yet", which is distinct
//! from `Some(vec![])` ("discovered, nothing there"). The canonical graph
//! of a peripheral has every list populated; a central's projection starts
//! empty and grows through the `merge_*` operations.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use uuid::Uuid;

use super::BleError;

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID.
pub fn uuid_from_u16(short: u16) -> Uuid {
    const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;
    Uuid::from_u128(BASE | ((short as u128) << 96))
}


macro_rules! attribute_handle {
    ($name:ident) => {
        /// Identity of one attribute instance. Several attributes may share a
        /// UUID; their handles always differ.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

attribute_handle!(ServiceId);
attribute_handle!(CharacteristicId);
attribute_handle!(DescriptorId);

/// Capabilities of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u16);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ---------------------------------------------------------------------------
// Specs: how a simulated peripheral's attribute tree is described
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DescriptorSpec {
    pub uuid: Uuid,
    pub value: Option<Bytes>,
}

impl DescriptorSpec {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, value: None }
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Bytes>,
    pub descriptors: Vec<DescriptorSpec>,
}

impl CharacteristicSpec {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: None,
            descriptors: Vec::new(),
        }
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn descriptor(mut self, descriptor: DescriptorSpec) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub uuid: Uuid,
    pub primary: bool,
    pub included: Vec<ServiceSpec>,
    pub characteristics: Vec<CharacteristicSpec>,
}

impl ServiceSpec {
    /// A primary service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            included: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self {
            primary: false,
            ..Self::new(uuid)
        }
    }

    pub fn characteristic(mut self, characteristic: CharacteristicSpec) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn include(mut self, service: ServiceSpec) -> Self {
        self.included.push(service);
        self
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    id: ServiceId,
    uuid: Uuid,
    is_primary: bool,
    included_services: Option<Vec<ServiceId>>,
    characteristics: Option<Vec<CharacteristicId>>,
}

impl Service {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn included_services(&self) -> Option<&[ServiceId]> {
        self.included_services.as_deref()
    }

    pub fn characteristics(&self) -> Option<&[CharacteristicId]> {
        self.characteristics.as_deref()
    }

    fn stripped(&self) -> Self {
        Self {
            included_services: None,
            characteristics: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    id: CharacteristicId,
    uuid: Uuid,
    service: Option<ServiceId>,
    properties: CharacteristicProperties,
    value: Option<Bytes>,
    is_notifying: bool,
    descriptors: Option<Vec<DescriptorId>>,
}

impl Characteristic {
    pub fn id(&self) -> CharacteristicId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The owning service. Fails fast on a node that was never attached.
    pub fn service(&self) -> Result<ServiceId, BleError> {
        self.service.ok_or(BleError::NotAttached)
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn is_notifying(&self) -> bool {
        self.is_notifying
    }

    pub fn descriptors(&self) -> Option<&[DescriptorId]> {
        self.descriptors.as_deref()
    }

    fn stripped(&self) -> Self {
        Self {
            value: None,
            is_notifying: false,
            descriptors: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    id: DescriptorId,
    uuid: Uuid,
    characteristic: Option<CharacteristicId>,
    value: Option<Bytes>,
}

impl Descriptor {
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The owning characteristic. Fails fast on a node that was never attached.
    pub fn characteristic(&self) -> Result<CharacteristicId, BleError> {
        self.characteristic.ok_or(BleError::NotAttached)
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    fn stripped(&self) -> Self {
        Self {
            value: None,
            ..self.clone()
        }
    }
}

fn uuid_matches(filter: Option<&[Uuid]>, uuid: Uuid) -> bool {
    match filter {
        None => true,
        Some(uuids) => uuids.is_empty() || uuids.contains(&uuid),
    }
}

/// Entries of `canonical` not yet listed in `present`, in canonical order.
fn missing<I: Copy + PartialEq>(
    canonical: &[I],
    present: Option<&Vec<I>>,
    mut accept: impl FnMut(I) -> bool,
) -> Vec<I> {
    canonical
        .iter()
        .copied()
        .filter(|id| present.map_or(true, |p| !p.contains(id)))
        .filter(|id| accept(*id))
        .collect()
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeGraph {
    services: Option<Vec<ServiceId>>,
    service_nodes: HashMap<ServiceId, Service>,
    characteristic_nodes: HashMap<CharacteristicId, Characteristic>,
    descriptor_nodes: HashMap<DescriptorId, Descriptor>,
    /// Last handle allocated by this graph. Handles are never reused, even
    /// after the attribute they named was removed.
    last_handle: u64,
}

impl AttributeGraph {
    /// An empty graph where nothing has been discovered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fully populated graph built from specs. Handles are allocated in
    /// declaration order.
    pub fn from_specs(specs: impl IntoIterator<Item = ServiceSpec>) -> Self {
        let mut graph = Self {
            services: Some(Vec::new()),
            ..Self::default()
        };
        for spec in specs {
            graph.add_service(spec);
        }
        graph
    }

    /// Add a top-level service with its whole subtree.
    pub fn add_service(&mut self, spec: ServiceSpec) -> ServiceId {
        let id = self.insert_service_tree(spec);
        self.services.get_or_insert_with(Vec::new).push(id);
        id
    }

    fn next_handle(&mut self) -> u64 {
        self.last_handle += 1;
        self.last_handle
    }

    fn insert_service_tree(&mut self, spec: ServiceSpec) -> ServiceId {
        let id = ServiceId(self.next_handle());
        let included = spec
            .included
            .into_iter()
            .map(|s| self.insert_service_tree(s))
            .collect();
        let mut characteristics = Vec::with_capacity(spec.characteristics.len());
        for c in spec.characteristics {
            let char_id = CharacteristicId(self.next_handle());
            let mut descriptors = Vec::with_capacity(c.descriptors.len());
            for d in c.descriptors {
                let desc_id = DescriptorId(self.next_handle());
                self.descriptor_nodes.insert(
                    desc_id,
                    Descriptor {
                        id: desc_id,
                        uuid: d.uuid,
                        characteristic: Some(char_id),
                        value: d.value,
                    },
                );
                descriptors.push(desc_id);
            }
            self.characteristic_nodes.insert(
                char_id,
                Characteristic {
                    id: char_id,
                    uuid: c.uuid,
                    service: Some(id),
                    properties: c.properties,
                    value: c.value,
                    is_notifying: false,
                    descriptors: Some(descriptors),
                },
            );
            characteristics.push(char_id);
        }
        self.service_nodes.insert(
            id,
            Service {
                id,
                uuid: spec.uuid,
                is_primary: spec.primary,
                included_services: Some(included),
                characteristics: Some(characteristics),
            },
        );
        id
    }

    /// Remove a service, its characteristics and their descriptors.
    /// Services it includes are left alone; references to it are dropped.
    pub fn remove_service(&mut self, id: ServiceId) -> Option<Service> {
        let service = self.service_nodes.remove(&id)?;
        for char_id in service.characteristics.iter().flatten() {
            if let Some(c) = self.characteristic_nodes.remove(char_id) {
                for desc_id in c.descriptors.iter().flatten() {
                    self.descriptor_nodes.remove(desc_id);
                }
            }
        }
        if let Some(roots) = self.services.as_mut() {
            roots.retain(|s| *s != id);
        }
        for other in self.service_nodes.values_mut() {
            if let Some(included) = other.included_services.as_mut() {
                included.retain(|s| *s != id);
            }
        }
        Some(service)
    }

    /// Drop everything discovered.
    pub fn clear(&mut self) {
        *self = Self {
            last_handle: self.last_handle,
            ..Self::default()
        };
    }

    /// Top-level services, or `None` before service discovery.
    pub fn services(&self) -> Option<Vec<&Service>> {
        self.services
            .as_ref()
            .map(|ids| ids.iter().filter_map(|id| self.service_nodes.get(id)).collect())
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.service_nodes.get(&id)
    }

    pub fn characteristic(&self, id: CharacteristicId) -> Option<&Characteristic> {
        self.characteristic_nodes.get(&id)
    }

    pub fn descriptor(&self, id: DescriptorId) -> Option<&Descriptor> {
        self.descriptor_nodes.get(&id)
    }

    pub fn included_services(&self, service: ServiceId) -> Option<Vec<&Service>> {
        let ids = self.service_nodes.get(&service)?.included_services.as_ref()?;
        Some(ids.iter().filter_map(|id| self.service_nodes.get(id)).collect())
    }

    pub fn characteristics(&self, service: ServiceId) -> Option<Vec<&Characteristic>> {
        let ids = self.service_nodes.get(&service)?.characteristics.as_ref()?;
        Some(
            ids.iter()
                .filter_map(|id| self.characteristic_nodes.get(id))
                .collect(),
        )
    }

    pub fn descriptors(&self, characteristic: CharacteristicId) -> Option<Vec<&Descriptor>> {
        let ids = self
            .characteristic_nodes
            .get(&characteristic)?
            .descriptors
            .as_ref()?;
        Some(ids.iter().filter_map(|id| self.descriptor_nodes.get(id)).collect())
    }

    /// First top-level service with the given UUID.
    pub fn find_service(&self, uuid: Uuid) -> Option<&Service> {
        self.services()?.into_iter().find(|s| s.uuid == uuid)
    }

    /// First known characteristic with the given UUID, in service order.
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.service_order()
            .into_iter()
            .filter_map(|s| self.characteristics(s))
            .flatten()
            .find(|c| c.uuid == uuid)
    }

    /// First known descriptor with the given UUID, in service order.
    pub fn find_descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
        self.service_order()
            .into_iter()
            .filter_map(|s| self.characteristics(s))
            .flatten()
            .filter_map(|c| self.descriptors(c.id))
            .flatten()
            .find(|d| d.uuid == uuid)
    }

    /// Top-level services followed by any other known service.
    fn service_order(&self) -> Vec<ServiceId> {
        let mut order: Vec<ServiceId> = self.services.clone().unwrap_or_default();
        let mut rest: Vec<ServiceId> = self
            .service_nodes
            .keys()
            .copied()
            .filter(|id| !order.contains(id))
            .collect();
        rest.sort();
        order.extend(rest);
        order
    }

    /// UUIDs of the top-level services.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.services()
            .map(|list| list.into_iter().map(|s| s.uuid).collect())
            .unwrap_or_default()
    }

    pub fn contains_service(&self, id: ServiceId) -> bool {
        self.service_nodes.contains_key(&id)
    }

    /// Whether the characteristic and its service are both present.
    pub fn contains_characteristic(&self, id: CharacteristicId) -> bool {
        let Some(c) = self.characteristic_nodes.get(&id) else {
            return false;
        };
        c.service
            .and_then(|s| self.service_nodes.get(&s))
            .and_then(|s| s.characteristics.as_ref())
            .map_or(false, |list| list.contains(&id))
    }

    /// Whether the descriptor and its whole parent chain are present.
    pub fn contains_descriptor(&self, id: DescriptorId) -> bool {
        let Some(d) = self.descriptor_nodes.get(&id) else {
            return false;
        };
        let Some(char_id) = d.characteristic else {
            return false;
        };
        self.contains_characteristic(char_id)
            && self.characteristic_nodes[&char_id]
                .descriptors
                .as_ref()
                .map_or(false, |list| list.contains(&id))
    }

    // -----------------------------------------------------------------------
    // Incremental discovery against a canonical graph
    // -----------------------------------------------------------------------

    /// Canonical top-level services matching `filter` not yet discovered here.
    pub fn undiscovered_services(
        &self,
        canonical: &AttributeGraph,
        filter: Option<&[Uuid]>,
    ) -> Vec<ServiceId> {
        let Some(all) = canonical.services.as_ref() else {
            return Vec::new();
        };
        missing(all, self.services.as_ref(), |id| {
            canonical
                .service_nodes
                .get(&id)
                .map_or(false, |s| uuid_matches(filter, s.uuid))
        })
    }

    /// Append undiscovered services as stripped copies. Returns the new ones.
    pub fn merge_services(
        &mut self,
        canonical: &AttributeGraph,
        filter: Option<&[Uuid]>,
    ) -> Vec<ServiceId> {
        let new = self.undiscovered_services(canonical, filter);
        for id in &new {
            let copy = canonical.service_nodes[id].stripped();
            self.service_nodes.entry(*id).or_insert(copy);
        }
        self.services.get_or_insert_with(Vec::new).extend(&new);
        new
    }

    /// `None` when `service` is unknown here or in the canonical graph.
    pub fn undiscovered_included_services(
        &self,
        canonical: &AttributeGraph,
        service: ServiceId,
        filter: Option<&[Uuid]>,
    ) -> Option<Vec<ServiceId>> {
        let local = self.service_nodes.get(&service)?;
        let all = canonical
            .service_nodes
            .get(&service)?
            .included_services
            .as_ref()?;
        Some(missing(all, local.included_services.as_ref(), |id| {
            canonical
                .service_nodes
                .get(&id)
                .map_or(false, |s| uuid_matches(filter, s.uuid))
        }))
    }

    pub fn merge_included_services(
        &mut self,
        canonical: &AttributeGraph,
        service: ServiceId,
        filter: Option<&[Uuid]>,
    ) -> Option<Vec<ServiceId>> {
        let new = self.undiscovered_included_services(canonical, service, filter)?;
        for id in &new {
            let copy = canonical.service_nodes[id].stripped();
            self.service_nodes.entry(*id).or_insert(copy);
        }
        let local = self.service_nodes.get_mut(&service)?;
        local
            .included_services
            .get_or_insert_with(Vec::new)
            .extend(&new);
        Some(new)
    }

    pub fn undiscovered_characteristics(
        &self,
        canonical: &AttributeGraph,
        service: ServiceId,
        filter: Option<&[Uuid]>,
    ) -> Option<Vec<CharacteristicId>> {
        let local = self.service_nodes.get(&service)?;
        let all = canonical
            .service_nodes
            .get(&service)?
            .characteristics
            .as_ref()?;
        Some(missing(all, local.characteristics.as_ref(), |id| {
            canonical
                .characteristic_nodes
                .get(&id)
                .map_or(false, |c| uuid_matches(filter, c.uuid))
        }))
    }

    pub fn merge_characteristics(
        &mut self,
        canonical: &AttributeGraph,
        service: ServiceId,
        filter: Option<&[Uuid]>,
    ) -> Option<Vec<CharacteristicId>> {
        let new = self.undiscovered_characteristics(canonical, service, filter)?;
        for id in &new {
            let copy = canonical.characteristic_nodes[id].stripped();
            self.characteristic_nodes.insert(*id, copy);
        }
        let local = self.service_nodes.get_mut(&service)?;
        local
            .characteristics
            .get_or_insert_with(Vec::new)
            .extend(&new);
        Some(new)
    }

    pub fn undiscovered_descriptors(
        &self,
        canonical: &AttributeGraph,
        characteristic: CharacteristicId,
    ) -> Option<Vec<DescriptorId>> {
        if !self.contains_characteristic(characteristic) {
            return None;
        }
        let local = self.characteristic_nodes.get(&characteristic)?;
        let all = canonical
            .characteristic_nodes
            .get(&characteristic)?
            .descriptors
            .as_ref()?;
        Some(missing(all, local.descriptors.as_ref(), |_| true))
    }

    pub fn merge_descriptors(
        &mut self,
        canonical: &AttributeGraph,
        characteristic: CharacteristicId,
    ) -> Option<Vec<DescriptorId>> {
        let new = self.undiscovered_descriptors(canonical, characteristic)?;
        for id in &new {
            let copy = canonical.descriptor_nodes[id].stripped();
            self.descriptor_nodes.insert(*id, copy);
        }
        let local = self.characteristic_nodes.get_mut(&characteristic)?;
        local.descriptors.get_or_insert_with(Vec::new).extend(&new);
        Some(new)
    }

    /// Remove every discovered service that no longer exists (by identity)
    /// in `canonical`. Returns the removed services.
    pub fn invalidate_against(&mut self, canonical: &AttributeGraph) -> Vec<Service> {
        let mut gone: Vec<ServiceId> = self
            .service_nodes
            .keys()
            .copied()
            .filter(|id| !canonical.service_nodes.contains_key(id))
            .collect();
        gone.sort();
        gone.into_iter()
            .filter_map(|id| self.remove_service(id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Mutation of known attributes
    // -----------------------------------------------------------------------

    pub fn set_characteristic_value(&mut self, id: CharacteristicId, value: Bytes) -> bool {
        match self.characteristic_nodes.get_mut(&id) {
            Some(c) => {
                c.value = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn set_notifying(&mut self, id: CharacteristicId, enabled: bool) -> bool {
        match self.characteristic_nodes.get_mut(&id) {
            Some(c) => {
                c.is_notifying = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_descriptor_value(&mut self, id: DescriptorId, value: Bytes) -> bool {
        match self.descriptor_nodes.get_mut(&id) {
            Some(d) => {
                d.value = Some(value);
                true
            }
            None => false,
        }
    }
}
