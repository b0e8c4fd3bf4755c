// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Notification attributes (`pmin`, `pmax`, `epmin`, `epmax`, `gt`, `lt`,
//! `step`, `con`) and their inheritance rules.
//!
//! Attributes may be attached at four levels: resource, object instance,
//! object and server defaults. Resolution walks that chain taking, for each
//! field independently, the first defined value.

/// Confirmable-delivery preference attached to an observation attribute set.
///
/// `Explicit NON` and `unset` are distinct on purpose: an explicit `con = 0`
/// overrides the engine-wide confirmable-notifications setting, while an
/// unset value defers to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConAttr {
    /// No preference recorded; the engine-wide default applies.
    #[default]
    Unset,
    /// Non-confirmable delivery preferred, even if the engine-wide default
    /// asks for confirmable notifications.
    NonConfirmable,
    /// Confirmable delivery preferred.
    Confirmable,
}

/// A resolved or partially-resolved attribute set.
///
/// All period fields are seconds. `None` means "not defined at this level";
/// after resolution it means "not defined anywhere along the chain".
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Attributes {
    /// Minimum seconds between notifications.
    pub pmin: Option<u32>,
    /// Maximum seconds between notifications; also a trigger.
    pub pmax: Option<u32>,
    /// Minimum seconds between re-reads from the data model.
    pub epmin: Option<u32>,
    /// Maximum evaluation period (reserved; resolved but never enforced).
    pub epmax: Option<u32>,
    /// Upper threshold; crossing it triggers a notification.
    pub gt: Option<f64>,
    /// Lower threshold; crossing it triggers a notification.
    pub lt: Option<f64>,
    /// Minimum change between the last sent value and the new one.
    pub step: Option<f64>,
    /// Confirmable-delivery preference.
    pub con: ConAttr,
}

impl Attributes {
    /// Fills every field that is still undefined in `self` from `other`.
    ///
    /// This is one step of the resource → instance → object → server-default
    /// resolution chain.
    pub fn fill_missing_from(&mut self, other: &Attributes) {
        self.pmin = self.pmin.or(other.pmin);
        self.pmax = self.pmax.or(other.pmax);
        self.epmin = self.epmin.or(other.epmin);
        self.epmax = self.epmax.or(other.epmax);
        self.gt = self.gt.or(other.gt);
        self.lt = self.lt.or(other.lt);
        self.step = self.step.or(other.step);
        if self.con == ConAttr::Unset {
            self.con = other.con;
        }
    }

    /// `pmin` with the unset case floored to zero.
    #[must_use]
    pub fn effective_pmin(&self) -> u32 {
        self.pmin.unwrap_or(0)
    }

    /// True iff `pmax` may drive periodic triggers: it must be defined,
    /// positive and not smaller than `pmin`.
    #[must_use]
    pub fn pmax_valid(&self) -> bool {
        match self.pmax {
            Some(pmax) => pmax > 0 && pmax >= self.effective_pmin(),
            None => false,
        }
    }

    /// True iff any of the change-detection attributes is defined.
    #[must_use]
    pub fn has_numeric_conditions(&self) -> bool {
        self.gt.is_some() || self.lt.is_some() || self.step.is_some()
    }
}

/// Errors produced while validating attribute writes.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AttributeError {
    /// Period attributes must be non-negative.
    #[error("negative value {value} for period attribute {name}")]
    NegativePeriod {
        /// Attribute name as written by the server.
        name: &'static str,
        /// The rejected value.
        value: i64,
    },
    /// Threshold and step attributes must be actual numbers.
    #[error("non-finite value for attribute {name}")]
    NotFinite {
        /// Attribute name as written by the server.
        name: &'static str,
    },
    /// `con` accepts only -1 (unset), 0 (non-confirmable) or 1 (confirmable).
    #[error("con attribute out of range: {value}")]
    ConOutOfRange {
        /// The rejected value.
        value: i64,
    },
}

/// Attribute values exactly as carried by a Write-Attributes request, before
/// validation. Invalid raw sets are rejected with a Bad-Option-class error
/// instead of reaching attribute storage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawAttributes {
    /// Raw `pmin` seconds; negative values are rejected.
    pub pmin: Option<i64>,
    /// Raw `pmax` seconds; negative values are rejected.
    pub pmax: Option<i64>,
    /// Raw `epmin` seconds; negative values are rejected.
    pub epmin: Option<i64>,
    /// Raw `epmax` seconds; negative values are rejected.
    pub epmax: Option<i64>,
    /// Raw `gt` threshold; must be finite.
    pub gt: Option<f64>,
    /// Raw `lt` threshold; must be finite.
    pub lt: Option<f64>,
    /// Raw `step` delta; must be finite.
    pub step: Option<f64>,
    /// Raw `con` value; -1, 0 or 1.
    pub con: Option<i64>,
}

fn checked_period(name: &'static str, raw: Option<i64>) -> Result<Option<u32>, AttributeError> {
    match raw {
        None => Ok(None),
        Some(value) if value < 0 => Err(AttributeError::NegativePeriod { name, value }),
        Some(value) => Ok(Some(u32::try_from(value).unwrap_or(u32::MAX))),
    }
}

fn checked_threshold(name: &'static str, raw: Option<f64>) -> Result<Option<f64>, AttributeError> {
    match raw {
        Some(value) if !value.is_finite() => Err(AttributeError::NotFinite { name }),
        other => Ok(other),
    }
}

impl TryFrom<RawAttributes> for Attributes {
    type Error = AttributeError;

    fn try_from(raw: RawAttributes) -> Result<Attributes, AttributeError> {
        let con = match raw.con {
            None | Some(-1) => ConAttr::Unset,
            Some(0) => ConAttr::NonConfirmable,
            Some(1) => ConAttr::Confirmable,
            Some(value) => return Err(AttributeError::ConOutOfRange { value }),
        };
        Ok(Attributes {
            pmin: checked_period("pmin", raw.pmin)?,
            pmax: checked_period("pmax", raw.pmax)?,
            epmin: checked_period("epmin", raw.epmin)?,
            epmax: checked_period("epmax", raw.epmax)?,
            gt: checked_threshold("gt", raw.gt)?,
            lt: checked_threshold("lt", raw.lt)?,
            step: checked_threshold("step", raw.step)?,
            con,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_defined_wins_per_field() {
        let mut resolved = Attributes {
            pmin: Some(5),
            ..Attributes::default()
        };
        let instance_level = Attributes {
            pmin: Some(99),
            pmax: Some(60),
            con: ConAttr::NonConfirmable,
            ..Attributes::default()
        };
        let object_level = Attributes {
            pmax: Some(7),
            gt: Some(20.0),
            con: ConAttr::Confirmable,
            ..Attributes::default()
        };

        resolved.fill_missing_from(&instance_level);
        resolved.fill_missing_from(&object_level);

        assert_eq!(resolved.pmin, Some(5));
        assert_eq!(resolved.pmax, Some(60));
        assert_eq!(resolved.gt, Some(20.0));
        assert_eq!(resolved.con, ConAttr::NonConfirmable);
    }

    #[test]
    fn pmax_validity() {
        let mut attrs = Attributes::default();
        assert!(!attrs.pmax_valid());

        attrs.pmax = Some(0);
        assert!(!attrs.pmax_valid());

        attrs.pmax = Some(10);
        attrs.pmin = Some(20);
        assert!(!attrs.pmax_valid());

        attrs.pmin = Some(10);
        assert!(attrs.pmax_valid());
    }

    #[test]
    fn negative_periods_rejected_at_write_time() {
        let raw = RawAttributes {
            pmin: Some(-1),
            ..RawAttributes::default()
        };
        assert_eq!(
            Attributes::try_from(raw),
            Err(AttributeError::NegativePeriod {
                name: "pmin",
                value: -1
            })
        );
    }

    #[test]
    fn con_tri_state_preserved() {
        let unset = RawAttributes::default();
        let explicit_non = RawAttributes {
            con: Some(0),
            ..RawAttributes::default()
        };
        assert_eq!(
            Attributes::try_from(unset).map(|a| a.con),
            Ok(ConAttr::Unset)
        );
        assert_eq!(
            Attributes::try_from(explicit_non).map(|a| a.con),
            Ok(ConAttr::NonConfirmable)
        );
        assert_eq!(
            Attributes::try_from(RawAttributes {
                con: Some(2),
                ..RawAttributes::default()
            }),
            Err(AttributeError::ConOutOfRange { value: 2 })
        );
    }
}
