// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Update-detection rules evaluated when a trigger fires.

use crate::config::ObserveConfig;
use lwm2m_coap::ReliabilityHint;
use lwm2m_core::{Attributes, Batch, ConAttr, Path};
use std::time::Duration;
use tokio::time::Instant;

/// True iff a valid `pmax` has elapsed since the newest value's timestamp.
pub(crate) fn pmax_expired(newest_timestamp: Instant, attrs: &Attributes, now: Instant) -> bool {
    match attrs.pmax {
        Some(pmax) if attrs.pmax_valid() => {
            now.saturating_duration_since(newest_timestamp) >= Duration::from_secs(pmax.into())
        }
        _ => false,
    }
}

/// True iff the batch is old enough (w.r.t. `epmin`) to warrant a re-read
/// from the data model. An unset `epmin` always re-reads.
pub(crate) fn epmin_expired(batch: &Batch, attrs: &Attributes, now: Instant) -> bool {
    match attrs.epmin {
        None => true,
        Some(epmin) => {
            now.saturating_duration_since(batch.compiled_at())
                >= Duration::from_secs(epmin.into())
        }
    }
}

fn step_exceeded(step: Option<f64>, previous: f64, new: f64) -> bool {
    step.is_some_and(|step| (new - previous).abs() >= step)
}

/// Strict, direction-agnostic threshold crossing.
fn threshold_crossed(threshold: Option<f64>, previous: f64, new: f64) -> bool {
    threshold.is_some_and(|threshold| {
        (previous <= threshold && new > threshold) || (previous >= threshold && new < threshold)
    })
}

/// Decides whether a freshly-read value warrants a notification, given the
/// previous value for the same path.
///
/// Equal values never notify. When either value is non-numeric, or none of
/// `step`/`lt`/`gt` is set, any change notifies. Otherwise at least one of
/// the numeric conditions must hold.
pub(crate) fn should_update_value(
    path: &Path,
    attrs: &Attributes,
    previous: &Batch,
    new: &Batch,
) -> bool {
    if previous.values_equal(new) {
        return false;
    }
    let numeric = if path.rid().is_some() {
        previous.numeric_value().zip(new.numeric_value())
    } else {
        None
    };
    match numeric {
        Some((previous, new)) if attrs.has_numeric_conditions() => {
            step_exceeded(attrs.step, previous, new)
                || threshold_crossed(attrs.lt, previous, new)
                || threshold_crossed(attrs.gt, previous, new)
        }
        _ => true,
    }
}

/// Folds one path's `pmax` into the minimum over all of an observation's
/// paths, considering only valid values.
pub(crate) fn fold_min_pmax(current: Option<u32>, attrs: &Attributes) -> Option<u32> {
    if !attrs.pmax_valid() {
        return current;
    }
    match (current, attrs.pmax) {
        (Some(current), Some(pmax)) => Some(current.min(pmax)),
        (None, pmax) => pmax,
        (current, None) => current,
    }
}

/// Maps the folded `con` attribute (max over paths) and the engine-wide
/// default onto a reliability hint. An explicit non-confirmable `con`
/// overrides the engine default; an unset one defers to it.
pub(crate) fn reliability_from_con(con: ConAttr, config: &ObserveConfig) -> ReliabilityHint {
    match con {
        ConAttr::Confirmable => ReliabilityHint::PreferConfirmable,
        ConAttr::NonConfirmable => ReliabilityHint::PreferNonConfirmable,
        ConAttr::Unset => {
            if config.confirmable_notifications {
                ReliabilityHint::PreferConfirmable
            } else {
                ReliabilityHint::PreferNonConfirmable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_core::{BatchBuilder, BatchEntry, SharedBatch, Value};
    use pretty_assertions::assert_eq;

    fn numeric_batch(value: f64) -> SharedBatch {
        let mut builder = BatchBuilder::new();
        builder.add(BatchEntry::new(
            Path::resource(42, 69, 4),
            Value::Double(value),
        ));
        builder.compile(Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn equal_values_never_notify() {
        let attrs = Attributes::default();
        let a = numeric_batch(5.0);
        let b = numeric_batch(5.0);
        assert!(!should_update_value(
            &Path::resource(42, 69, 4),
            &attrs,
            &a,
            &b
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn any_change_notifies_without_numeric_conditions() {
        let attrs = Attributes::default();
        let a = numeric_batch(5.0);
        let b = numeric_batch(6.0);
        assert!(should_update_value(
            &Path::resource(42, 69, 4),
            &attrs,
            &a,
            &b
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lt_gt_strict_crossings() {
        // lt = 69, gt = 777, starting at 514 (in between).
        let attrs = Attributes {
            lt: Some(69.0),
            gt: Some(777.0),
            ..Attributes::default()
        };
        let path = Path::resource(42, 69, 4);
        let sequence = [
            (514.0, 42.43, true),   // crosses lt downward
            (42.43, 14.7, false),   // stays below lt
            (14.7, 695.0, true),    // crosses lt upward
            (695.0, 69.0, false),   // lands exactly on lt: no strict crossing
            (69.0, 1024.0, true),   // crosses gt upward
            (1024.0, 999.0, false), // stays above... between gt bounds
            (999.0, -69.75, true),  // crosses both downward
        ];
        for (previous, new, expected) in sequence {
            let a = numeric_batch(previous);
            let b = numeric_batch(new);
            assert_eq!(
                should_update_value(&path, &attrs, &a, &b),
                expected,
                "transition {previous} -> {new}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn step_gates_small_changes() {
        let attrs = Attributes {
            step: Some(10.0),
            ..Attributes::default()
        };
        let path = Path::resource(42, 69, 4);
        assert!(!should_update_value(
            &path,
            &attrs,
            &numeric_batch(100.0),
            &numeric_batch(105.0)
        ));
        assert!(should_update_value(
            &path,
            &attrs,
            &numeric_batch(100.0),
            &numeric_batch(110.0)
        ));
        assert!(should_update_value(
            &path,
            &attrs,
            &numeric_batch(100.0),
            &numeric_batch(90.0)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pmax_folding_ignores_invalid_values() {
        let valid = Attributes {
            pmax: Some(60),
            ..Attributes::default()
        };
        let invalid = Attributes {
            pmax: Some(0),
            ..Attributes::default()
        };
        assert_eq!(fold_min_pmax(None, &valid), Some(60));
        assert_eq!(fold_min_pmax(Some(60), &invalid), Some(60));
        assert_eq!(
            fold_min_pmax(
                Some(60),
                &Attributes {
                    pmax: Some(10),
                    ..Attributes::default()
                }
            ),
            Some(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn con_overrides_engine_default() {
        let confirmable_engine = ObserveConfig {
            confirmable_notifications: true,
            ..ObserveConfig::default()
        };
        assert_eq!(
            reliability_from_con(ConAttr::Unset, &confirmable_engine),
            ReliabilityHint::PreferConfirmable
        );
        // Explicit con=0 wins over the engine-wide default.
        assert_eq!(
            reliability_from_con(ConAttr::NonConfirmable, &confirmable_engine),
            ReliabilityHint::PreferNonConfirmable
        );
        assert_eq!(
            reliability_from_con(ConAttr::Unset, &ObserveConfig::default()),
            ReliabilityHint::PreferNonConfirmable
        );
    }
}
