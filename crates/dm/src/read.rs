// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Whole-path reads into value batches.

use crate::{DataModel, DmError, ResourceInfo};
use lwm2m_core::{BatchBuilder, BatchEntry, Path, SharedBatch, Value};
use tokio::time::Instant;
use tracing::trace;

/// Reads everything under `path` into an immutable [`Batch`] stamped with
/// `now`.
///
/// Object paths enumerate their instances, instance paths their present
/// readable resources, multi-instance resources contribute an aggregate
/// marker followed by their instances. Direct reads of an absent or
/// non-readable resource fail; during instance- and object-level enumeration
/// such resources are silently skipped instead.
pub fn read_path<M: DataModel + ?Sized>(
    dm: &M,
    path: &Path,
    now: Instant,
) -> Result<SharedBatch, DmError> {
    let mut builder = BatchBuilder::new();
    match (path.oid(), path.iid(), path.rid(), path.riid()) {
        (None, ..) => {
            for oid in dm.list_objects() {
                read_object(dm, oid, &mut builder)?;
            }
        }
        (Some(oid), None, ..) => {
            if !dm.object_exists(oid) {
                return Err(DmError::NotFound { path: *path });
            }
            read_object(dm, oid, &mut builder)?;
        }
        (Some(oid), Some(iid), None, _) => {
            require_instance(dm, path, oid, iid)?;
            read_instance(dm, oid, iid, &mut builder)?;
        }
        (Some(oid), Some(iid), Some(rid), None) => {
            require_instance(dm, path, oid, iid)?;
            let info = require_readable(dm, path, oid, iid, rid)?;
            read_resource(dm, oid, iid, info, &mut builder)?;
        }
        (Some(oid), Some(iid), Some(rid), Some(riid)) => {
            require_instance(dm, path, oid, iid)?;
            let info = require_readable(dm, path, oid, iid, rid)?;
            if !info.ops.multi_instance
                || !dm.list_resource_instances(oid, iid, rid)?.contains(&riid)
            {
                return Err(DmError::NotFound { path: *path });
            }
            builder.add(dm.read_resource(oid, iid, rid, Some(riid))?);
        }
    }
    trace!(%path, entries = builder.len(), "read into batch");
    Ok(builder.compile(now))
}

fn require_instance<M: DataModel + ?Sized>(
    dm: &M,
    path: &Path,
    oid: u16,
    iid: u16,
) -> Result<(), DmError> {
    if !dm.object_exists(oid) || !dm.list_instances(oid)?.contains(&iid) {
        return Err(DmError::NotFound { path: *path });
    }
    Ok(())
}

fn require_readable<M: DataModel + ?Sized>(
    dm: &M,
    path: &Path,
    oid: u16,
    iid: u16,
    rid: u16,
) -> Result<ResourceInfo, DmError> {
    let info = dm
        .list_resources(oid, iid)?
        .into_iter()
        .find(|info| info.rid == rid && info.present)
        .ok_or(DmError::NotFound { path: *path })?;
    if !info.ops.read {
        return Err(DmError::NotReadable { path: *path });
    }
    Ok(info)
}

fn read_object<M: DataModel + ?Sized>(
    dm: &M,
    oid: u16,
    builder: &mut BatchBuilder,
) -> Result<(), DmError> {
    for iid in dm.list_instances(oid)? {
        read_instance(dm, oid, iid, builder)?;
    }
    Ok(())
}

fn read_instance<M: DataModel + ?Sized>(
    dm: &M,
    oid: u16,
    iid: u16,
    builder: &mut BatchBuilder,
) -> Result<(), DmError> {
    for info in dm.list_resources(oid, iid)? {
        if info.present && info.ops.read {
            read_resource(dm, oid, iid, info, builder)?;
        }
    }
    Ok(())
}

fn read_resource<M: DataModel + ?Sized>(
    dm: &M,
    oid: u16,
    iid: u16,
    info: ResourceInfo,
    builder: &mut BatchBuilder,
) -> Result<(), DmError> {
    if info.ops.multi_instance {
        builder.add(BatchEntry::new(
            Path::resource(oid, iid, info.rid),
            Value::StartAggregate,
        ));
        for riid in dm.list_resource_instances(oid, iid, info.rid)? {
            builder.add(dm.read_resource(oid, iid, info.rid, Some(riid))?);
        }
    } else {
        builder.add(dm.read_resource(oid, iid, info.rid, None)?);
    }
    Ok(())
}
