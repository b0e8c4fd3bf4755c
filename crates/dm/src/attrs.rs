// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Attribute-inheritance resolution.

use crate::{DataModel, DmError};
use lwm2m_core::{Attributes, Path, Ssid};

/// Resolves the effective attribute set for `path` as seen by server `ssid`.
///
/// For each field independently, the first defined value along
/// resource → instance → object wins; `pmin`/`pmax` still missing afterwards
/// are taken from the server-wide defaults. Levels whose entity does not
/// exist contribute nothing (the deeper levels are not even queried), so
/// attributes survive e.g. instance deletion exactly as far as the remaining
/// chain defines them.
pub fn effective_attrs<M: DataModel + ?Sized>(
    dm: &M,
    path: &Path,
    ssid: Ssid,
) -> Result<Attributes, DmError> {
    let mut attrs = Attributes::default();

    if let Some(oid) = path.oid() {
        if dm.object_exists(oid) {
            if let Some(iid) = path.iid() {
                if dm.list_instances(oid)?.contains(&iid) {
                    if let Some(rid) = path.rid() {
                        let resource_present = dm
                            .list_resources(oid, iid)?
                            .iter()
                            .any(|info| info.rid == rid && info.present);
                        if resource_present {
                            attrs.fill_missing_from(&dm.resource_attrs(oid, iid, rid, ssid)?);
                        }
                    }
                    attrs.fill_missing_from(&dm.instance_attrs(oid, iid, ssid)?);
                }
            }
            attrs.fill_missing_from(&dm.object_attrs(oid, ssid)?);
        }
    }

    if attrs.pmin.is_none() {
        attrs.pmin = dm.server_default_pmin(ssid);
    }
    if attrs.pmax.is_none() {
        attrs.pmax = dm.server_default_pmax(ssid);
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryModel;
    use lwm2m_core::Value;
    use pretty_assertions::assert_eq;

    const SSID: Ssid = 1;

    fn model() -> InMemoryModel {
        let model = InMemoryModel::new();
        model.add_server(SSID);
        model.add_single_resource(Path::resource(3, 0, 9), Value::Int(42));
        model
    }

    #[test]
    fn resource_level_wins() {
        let model = model();
        model.set_resource_attrs(
            Path::resource(3, 0, 9),
            SSID,
            Attributes {
                pmin: Some(5),
                ..Attributes::default()
            },
        );
        model.set_object_attrs(
            3,
            SSID,
            Attributes {
                pmin: Some(60),
                pmax: Some(120),
                ..Attributes::default()
            },
        );

        let attrs = effective_attrs(&model, &Path::resource(3, 0, 9), SSID).expect("resolved");
        assert_eq!(attrs.pmin, Some(5));
        assert_eq!(attrs.pmax, Some(120));
    }

    #[test]
    fn server_defaults_backstop_the_chain() {
        let model = model();
        model.set_server_defaults(SSID, Some(10), Some(300));

        let attrs = effective_attrs(&model, &Path::resource(3, 0, 9), SSID).expect("resolved");
        assert_eq!(attrs.pmin, Some(10));
        assert_eq!(attrs.pmax, Some(300));
    }

    #[test]
    fn missing_instance_skips_deeper_levels() {
        let model = model();
        model.set_resource_attrs(
            Path::resource(3, 0, 9),
            SSID,
            Attributes {
                pmin: Some(5),
                ..Attributes::default()
            },
        );
        model.set_object_attrs(
            3,
            SSID,
            Attributes {
                pmin: Some(60),
                ..Attributes::default()
            },
        );

        let attrs = effective_attrs(&model, &Path::resource(3, 7, 9), SSID).expect("resolved");
        assert_eq!(attrs.pmin, Some(60));
    }
}
