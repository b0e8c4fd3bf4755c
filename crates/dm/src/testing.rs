// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! An in-memory data model for tests.
//!
//! Interior mutability lets test code mutate values and attributes while the
//! engine under test holds a shared handle; everything stays on the scheduler
//! thread, matching the runtime's concurrency model.

use crate::{DataModel, DmError, ResourceInfo, ResourceOps};
use lwm2m_core::{
    AttributeError, Attributes, BatchEntry, Path, RawAttributes, Ssid, Value,
};
use std::cell::RefCell;
use std::collections::BTreeMap;

#[derive(Default)]
struct ObjectState {
    attrs: BTreeMap<Ssid, Attributes>,
    instances: BTreeMap<u16, InstanceState>,
}

#[derive(Default)]
struct InstanceState {
    attrs: BTreeMap<Ssid, Attributes>,
    resources: BTreeMap<u16, ResourceState>,
}

struct ResourceState {
    ops: ResourceOps,
    present: bool,
    attrs: BTreeMap<Ssid, Attributes>,
    data: ResourceData,
}

enum ResourceData {
    Single(Value),
    Multi(BTreeMap<u16, Value>),
}

struct ServerState {
    default_pmin: Option<u32>,
    default_pmax: Option<u32>,
    notification_storing: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<u16, ObjectState>,
    servers: BTreeMap<Ssid, ServerState>,
}

/// A mutable in-memory [`DataModel`].
#[derive(Default)]
pub struct InMemoryModel {
    state: RefCell<State>,
}

impl InMemoryModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> InMemoryModel {
        InMemoryModel::default()
    }

    /// Registers a server with no defaults and storing enabled.
    pub fn add_server(&self, ssid: Ssid) {
        let _ = self.state.borrow_mut().servers.insert(
            ssid,
            ServerState {
                default_pmin: None,
                default_pmax: None,
                notification_storing: true,
            },
        );
    }

    /// Removes a server, as if its Server Object instance was deleted.
    pub fn remove_server(&self, ssid: Ssid) {
        let _ = self.state.borrow_mut().servers.remove(&ssid);
    }

    /// Sets the server-wide default periods.
    pub fn set_server_defaults(&self, ssid: Ssid, pmin: Option<u32>, pmax: Option<u32>) {
        let mut state = self.state.borrow_mut();
        let server = state.servers.get_mut(&ssid).expect("unknown server");
        server.default_pmin = pmin;
        server.default_pmax = pmax;
    }

    /// Sets the "Notification Storing When Disabled or Offline" flag.
    pub fn set_notification_storing(&self, ssid: Ssid, storing: bool) {
        let mut state = self.state.borrow_mut();
        let server = state.servers.get_mut(&ssid).expect("unknown server");
        server.notification_storing = storing;
    }

    /// Creates a readable+writable single-instance resource (and the object /
    /// instance hierarchy above it, as needed).
    pub fn add_single_resource(&self, path: Path, value: Value) {
        self.add_resource_state(path, ResourceOps::RW, ResourceData::Single(value));
    }

    /// Creates a readable multi-instance resource.
    pub fn add_multi_resource(
        &self,
        path: Path,
        instances: impl IntoIterator<Item = (u16, Value)>,
    ) {
        self.add_resource_state(
            path,
            ResourceOps::RM,
            ResourceData::Multi(instances.into_iter().collect()),
        );
    }

    fn add_resource_state(&self, path: Path, ops: ResourceOps, data: ResourceData) {
        let (oid, iid, rid) = resource_ids(&path);
        let mut state = self.state.borrow_mut();
        let instance = state
            .objects
            .entry(oid)
            .or_default()
            .instances
            .entry(iid)
            .or_default();
        let _ = instance.resources.insert(
            rid,
            ResourceState {
                ops,
                present: true,
                attrs: BTreeMap::new(),
                data,
            },
        );
    }

    /// Overwrites a resource value; observers are not notified (the test
    /// decides when to call `notify_changed`).
    pub fn set_value(&self, path: Path, value: Value) {
        let (oid, iid, rid) = resource_ids(&path);
        let mut state = self.state.borrow_mut();
        let resource = state
            .objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .and_then(|instance| instance.resources.get_mut(&rid))
            .expect("unknown resource");
        match (&mut resource.data, path.riid()) {
            (ResourceData::Single(current), None) => *current = value,
            (ResourceData::Multi(instances), Some(riid)) => {
                let _ = instances.insert(riid, value);
            }
            _ => panic!("value/riid mismatch for {path}"),
        }
    }

    /// Changes the supported operations of a resource.
    pub fn set_resource_ops(&self, path: Path, ops: ResourceOps) {
        let (oid, iid, rid) = resource_ids(&path);
        let mut state = self.state.borrow_mut();
        let resource = state
            .objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .and_then(|instance| instance.resources.get_mut(&rid))
            .expect("unknown resource");
        resource.ops = ops;
    }

    /// Marks a resource present or absent without touching its value.
    pub fn set_present(&self, path: Path, present: bool) {
        let (oid, iid, rid) = resource_ids(&path);
        let mut state = self.state.borrow_mut();
        let resource = state
            .objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .and_then(|instance| instance.resources.get_mut(&rid))
            .expect("unknown resource");
        resource.present = present;
    }

    /// Attaches attributes directly at resource level.
    pub fn set_resource_attrs(&self, path: Path, ssid: Ssid, attrs: Attributes) {
        let (oid, iid, rid) = resource_ids(&path);
        let mut state = self.state.borrow_mut();
        let resource = state
            .objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .and_then(|instance| instance.resources.get_mut(&rid))
            .expect("unknown resource");
        let _ = resource.attrs.insert(ssid, attrs);
    }

    /// Attaches default attributes at instance level.
    pub fn set_instance_attrs(&self, oid: u16, iid: u16, ssid: Ssid, attrs: Attributes) {
        let mut state = self.state.borrow_mut();
        let instance = state
            .objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .expect("unknown instance");
        let _ = instance.attrs.insert(ssid, attrs);
    }

    /// Attaches default attributes at object level.
    pub fn set_object_attrs(&self, oid: u16, ssid: Ssid, attrs: Attributes) {
        let mut state = self.state.borrow_mut();
        let object = state.objects.get_mut(&oid).expect("unknown object");
        let _ = object.attrs.insert(ssid, attrs);
    }

    /// The Write-Attributes path: validates the raw attributes and stores
    /// them at resource level. Invalid sets are rejected before storage.
    pub fn write_resource_attrs(
        &self,
        path: Path,
        ssid: Ssid,
        raw: RawAttributes,
    ) -> Result<(), AttributeError> {
        let attrs = Attributes::try_from(raw)?;
        self.set_resource_attrs(path, ssid, attrs);
        Ok(())
    }
}

fn resource_ids(path: &Path) -> (u16, u16, u16) {
    match (path.oid(), path.iid(), path.rid()) {
        (Some(oid), Some(iid), Some(rid)) => (oid, iid, rid),
        _ => panic!("resource path expected, got {path}"),
    }
}

impl DataModel for InMemoryModel {
    fn list_objects(&self) -> Vec<u16> {
        self.state.borrow().objects.keys().copied().collect()
    }

    fn object_exists(&self, oid: u16) -> bool {
        self.state.borrow().objects.contains_key(&oid)
    }

    fn list_instances(&self, oid: u16) -> Result<Vec<u16>, DmError> {
        let state = self.state.borrow();
        let object = state.objects.get(&oid).ok_or(DmError::NotFound {
            path: Path::object(oid),
        })?;
        Ok(object.instances.keys().copied().collect())
    }

    fn list_resources(&self, oid: u16, iid: u16) -> Result<Vec<ResourceInfo>, DmError> {
        let state = self.state.borrow();
        let instance = state
            .objects
            .get(&oid)
            .and_then(|object| object.instances.get(&iid))
            .ok_or(DmError::NotFound {
                path: Path::instance(oid, iid),
            })?;
        Ok(instance
            .resources
            .iter()
            .map(|(&rid, resource)| ResourceInfo {
                rid,
                ops: resource.ops,
                present: resource.present,
            })
            .collect())
    }

    fn list_resource_instances(&self, oid: u16, iid: u16, rid: u16) -> Result<Vec<u16>, DmError> {
        let state = self.state.borrow();
        let resource = state
            .objects
            .get(&oid)
            .and_then(|object| object.instances.get(&iid))
            .and_then(|instance| instance.resources.get(&rid))
            .ok_or(DmError::NotFound {
                path: Path::resource(oid, iid, rid),
            })?;
        match &resource.data {
            ResourceData::Multi(instances) => Ok(instances.keys().copied().collect()),
            ResourceData::Single(_) => Ok(Vec::new()),
        }
    }

    fn read_resource(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
        riid: Option<u16>,
    ) -> Result<BatchEntry, DmError> {
        let state = self.state.borrow();
        let resource = state
            .objects
            .get(&oid)
            .and_then(|object| object.instances.get(&iid))
            .and_then(|instance| instance.resources.get(&rid))
            .filter(|resource| resource.present)
            .ok_or(DmError::NotFound {
                path: Path::resource(oid, iid, rid),
            })?;
        match (&resource.data, riid) {
            (ResourceData::Single(value), None) => Ok(BatchEntry::new(
                Path::resource(oid, iid, rid),
                value.clone(),
            )),
            (ResourceData::Multi(instances), Some(riid)) => {
                let value = instances.get(&riid).ok_or(DmError::NotFound {
                    path: Path::resource_instance(oid, iid, rid, riid),
                })?;
                Ok(BatchEntry::new(
                    Path::resource_instance(oid, iid, rid, riid),
                    value.clone(),
                ))
            }
            _ => Err(DmError::NotFound {
                path: Path::resource(oid, iid, rid),
            }),
        }
    }

    fn resource_attrs(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
        ssid: Ssid,
    ) -> Result<Attributes, DmError> {
        let state = self.state.borrow();
        Ok(state
            .objects
            .get(&oid)
            .and_then(|object| object.instances.get(&iid))
            .and_then(|instance| instance.resources.get(&rid))
            .and_then(|resource| resource.attrs.get(&ssid))
            .copied()
            .unwrap_or_default())
    }

    fn instance_attrs(&self, oid: u16, iid: u16, ssid: Ssid) -> Result<Attributes, DmError> {
        let state = self.state.borrow();
        Ok(state
            .objects
            .get(&oid)
            .and_then(|object| object.instances.get(&iid))
            .and_then(|instance| instance.attrs.get(&ssid))
            .copied()
            .unwrap_or_default())
    }

    fn object_attrs(&self, oid: u16, ssid: Ssid) -> Result<Attributes, DmError> {
        let state = self.state.borrow();
        Ok(state
            .objects
            .get(&oid)
            .and_then(|object| object.attrs.get(&ssid))
            .copied()
            .unwrap_or_default())
    }

    fn server_default_pmin(&self, ssid: Ssid) -> Option<u32> {
        self.state
            .borrow()
            .servers
            .get(&ssid)
            .and_then(|server| server.default_pmin)
    }

    fn server_default_pmax(&self, ssid: Ssid) -> Option<u32> {
        self.state
            .borrow()
            .servers
            .get(&ssid)
            .and_then(|server| server.default_pmax)
    }

    fn notification_storing(&self, ssid: Ssid) -> bool {
        self.state
            .borrow()
            .servers
            .get(&ssid)
            .is_none_or(|server| server.notification_storing)
    }

    fn active_servers(&self) -> Vec<Ssid> {
        self.state.borrow().servers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_attrs_validates_before_storing() {
        let model = InMemoryModel::new();
        model.add_server(1);
        model.add_single_resource(Path::resource(3, 0, 9), Value::Int(1));

        let bad = RawAttributes {
            pmin: Some(-5),
            ..RawAttributes::default()
        };
        assert!(model.write_resource_attrs(Path::resource(3, 0, 9), 1, bad).is_err());

        let good = RawAttributes {
            pmin: Some(5),
            con: Some(0),
            ..RawAttributes::default()
        };
        model
            .write_resource_attrs(Path::resource(3, 0, 9), 1, good)
            .expect("stored");
        let stored = model.resource_attrs(3, 0, 9, 1).expect("read back");
        assert_eq!(stored.pmin, Some(5));
        assert_eq!(stored.con, lwm2m_core::ConAttr::NonConfirmable);
    }

    #[test]
    fn storing_defaults_to_true_for_unknown_servers() {
        let model = InMemoryModel::new();
        assert!(model.notification_storing(7));
        model.add_server(7);
        model.set_notification_storing(7, false);
        assert!(!model.notification_storing(7));
    }
}
