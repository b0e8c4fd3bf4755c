// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Facade over the external LwM2M data model.
//!
//! The runtime consumes the data model exclusively through the [`DataModel`]
//! trait: listings, synchronous single-resource reads, per-level attribute
//! readers and server-wide settings. On top of it this crate provides the
//! two derived operations the observe engine needs: attribute-inheritance
//! resolution ([`attrs::effective_attrs`]) and whole-path batch reads
//! ([`read::read_path`]).

pub mod attrs;
pub mod read;
pub mod testing;

pub use attrs::effective_attrs;
pub use read::read_path;

use lwm2m_coap::Code;
use lwm2m_core::{Attributes, BatchEntry, Path, Ssid};
use std::rc::Rc;

/// Errors surfaced by data-model access.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DmError {
    /// The addressed entity does not exist.
    #[error("path {path} not found")]
    NotFound {
        /// The missing path.
        path: Path,
    },

    /// The requesting server may not access the entity.
    #[error("access to {path} denied")]
    Unauthorized {
        /// The protected path.
        path: Path,
    },

    /// The resource exists but does not support the Read operation.
    #[error("resource {path} is not readable")]
    NotReadable {
        /// The offending path.
        path: Path,
    },

    /// Failure inside the data-model implementation.
    #[error("data model error: {detail}")]
    Internal {
        /// Implementation-provided detail.
        detail: String,
    },
}

impl DmError {
    /// The CoAP response code this error maps to, used both for plain reads
    /// and for error observation values.
    #[must_use]
    pub fn response_code(&self) -> Code {
        match self {
            DmError::NotFound { .. } => Code::NOT_FOUND,
            DmError::Unauthorized { .. } => Code::UNAUTHORIZED,
            DmError::NotReadable { .. } => Code::METHOD_NOT_ALLOWED,
            DmError::Internal { .. } => Code::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Operations supported by a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceOps {
    /// Resource supports Read.
    pub read: bool,
    /// Resource supports Write.
    pub write: bool,
    /// Resource supports Execute.
    pub execute: bool,
    /// Resource has instances rather than a single value.
    pub multi_instance: bool,
}

impl ResourceOps {
    /// A single-instance readable resource.
    pub const R: ResourceOps = ResourceOps {
        read: true,
        write: false,
        execute: false,
        multi_instance: false,
    };
    /// A single-instance readable+writable resource.
    pub const RW: ResourceOps = ResourceOps {
        read: true,
        write: true,
        execute: false,
        multi_instance: false,
    };
    /// A multi-instance readable resource.
    pub const RM: ResourceOps = ResourceOps {
        read: true,
        write: false,
        execute: false,
        multi_instance: true,
    };
}

/// One row of a resource listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Resource ID.
    pub rid: u16,
    /// Supported operations.
    pub ops: ResourceOps,
    /// Whether the resource is instantiated in this object instance.
    pub present: bool,
}

/// The read interface the runtime consumes. Implementations are opaque to
/// the engine; all calls are synchronous and run on the scheduler thread.
pub trait DataModel {
    /// Registered Object IDs, ascending.
    fn list_objects(&self) -> Vec<u16>;

    /// True iff the object is registered.
    fn object_exists(&self, oid: u16) -> bool;

    /// Instance IDs of an object, ascending.
    fn list_instances(&self, oid: u16) -> Result<Vec<u16>, DmError>;

    /// Resource listing of an object instance, ascending by RID.
    fn list_resources(&self, oid: u16, iid: u16) -> Result<Vec<ResourceInfo>, DmError>;

    /// Instance IDs of a multi-instance resource, ascending.
    fn list_resource_instances(&self, oid: u16, iid: u16, rid: u16) -> Result<Vec<u16>, DmError>;

    /// Reads one resource (or resource instance when `riid` is given).
    fn read_resource(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
        riid: Option<u16>,
    ) -> Result<BatchEntry, DmError>;

    /// Attributes attached to a resource for `ssid`.
    fn resource_attrs(&self, oid: u16, iid: u16, rid: u16, ssid: Ssid)
    -> Result<Attributes, DmError>;

    /// Default attributes attached to an object instance for `ssid`.
    fn instance_attrs(&self, oid: u16, iid: u16, ssid: Ssid) -> Result<Attributes, DmError>;

    /// Default attributes attached to an object for `ssid`.
    fn object_attrs(&self, oid: u16, ssid: Ssid) -> Result<Attributes, DmError>;

    /// Server-wide Default Minimum Period, if configured.
    fn server_default_pmin(&self, ssid: Ssid) -> Option<u32>;

    /// Server-wide Default Maximum Period, if configured.
    fn server_default_pmax(&self, ssid: Ssid) -> Option<u32>;

    /// The server's "Notification Storing When Disabled or Offline" flag.
    /// Defaults to true when the Server Object does not say otherwise.
    fn notification_storing(&self, ssid: Ssid) -> bool;

    /// SSIDs of all known servers, ascending. Drives observe-state garbage
    /// collection.
    fn active_servers(&self) -> Vec<Ssid>;
}

impl<M: DataModel + ?Sized> DataModel for Rc<M> {
    fn list_objects(&self) -> Vec<u16> {
        (**self).list_objects()
    }

    fn object_exists(&self, oid: u16) -> bool {
        (**self).object_exists(oid)
    }

    fn list_instances(&self, oid: u16) -> Result<Vec<u16>, DmError> {
        (**self).list_instances(oid)
    }

    fn list_resources(&self, oid: u16, iid: u16) -> Result<Vec<ResourceInfo>, DmError> {
        (**self).list_resources(oid, iid)
    }

    fn list_resource_instances(&self, oid: u16, iid: u16, rid: u16) -> Result<Vec<u16>, DmError> {
        (**self).list_resource_instances(oid, iid, rid)
    }

    fn read_resource(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
        riid: Option<u16>,
    ) -> Result<BatchEntry, DmError> {
        (**self).read_resource(oid, iid, rid, riid)
    }

    fn resource_attrs(
        &self,
        oid: u16,
        iid: u16,
        rid: u16,
        ssid: Ssid,
    ) -> Result<Attributes, DmError> {
        (**self).resource_attrs(oid, iid, rid, ssid)
    }

    fn instance_attrs(&self, oid: u16, iid: u16, ssid: Ssid) -> Result<Attributes, DmError> {
        (**self).instance_attrs(oid, iid, ssid)
    }

    fn object_attrs(&self, oid: u16, ssid: Ssid) -> Result<Attributes, DmError> {
        (**self).object_attrs(oid, ssid)
    }

    fn server_default_pmin(&self, ssid: Ssid) -> Option<u32> {
        (**self).server_default_pmin(ssid)
    }

    fn server_default_pmax(&self, ssid: Ssid) -> Option<u32> {
        (**self).server_default_pmax(ssid)
    }

    fn notification_storing(&self, ssid: Ssid) -> bool {
        (**self).notification_storing(ssid)
    }

    fn active_servers(&self) -> Vec<Ssid> {
        (**self).active_servers()
    }
}
