// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Immutable snapshots of data-model reads.
//!
//! A [`Batch`] is produced by the data-model reader and consumed by the
//! observe engine: once compiled it never changes, and it is shared by
//! reference counting between the notification queue, `last_sent` history and
//! in-flight serialization cursors.

use crate::path::Path;
use bytes::Bytes;
use std::rc::Rc;
use tokio::time::Instant;

/// A single data-model value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Opaque bytes.
    Bytes(Bytes),
    /// UTF-8 string.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Double-precision float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Object link.
    Objlnk {
        /// Target Object ID.
        oid: u16,
        /// Target Object Instance ID.
        iid: u16,
    },
    /// Marker introducing the instances of a multi-instance resource; the
    /// entries that follow (with deeper paths) belong to it.
    StartAggregate,
}

impl Value {
    /// Numeric projection used by `step`/`lt`/`gt` evaluation.
    #[must_use]
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Uint(value) => Some(*value as f64),
            Value::Double(value) => Some(*value),
            _ => None,
        }
    }
}

/// One `(path, value, optional timestamp)` element of a batch.
///
/// The timestamp is a data-source-provided sample time in seconds, carried
/// through to timestamped payload formats; it takes no part in value
/// comparison.
#[derive(Clone, Debug)]
pub struct BatchEntry {
    /// Path the value was read from.
    pub path: Path,
    /// The value itself.
    pub value: Value,
    /// Optional sample timestamp (seconds, SenML `t` semantics).
    pub timestamp: Option<f64>,
}

impl BatchEntry {
    /// Creates an entry without a sample timestamp.
    #[must_use]
    pub fn new(path: Path, value: Value) -> BatchEntry {
        BatchEntry {
            path,
            value,
            timestamp: None,
        }
    }
}

/// Reference-counted handle to a compiled batch.
pub type SharedBatch = Rc<Batch>;

/// An immutable, reference-counted snapshot of one data-model read.
#[derive(Debug)]
pub struct Batch {
    compiled_at: Instant,
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// When the snapshot was compiled. Drives `epmin` re-read gating.
    #[must_use]
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// The snapshot entries, in read order.
    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// True iff both snapshots carry the same paths and values, in the same
    /// order. Compilation and sample timestamps are ignored.
    #[must_use]
    pub fn values_equal(&self, other: &Batch) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a.path == b.path && a.value == b.value)
    }

    /// Numeric projection of a single-value snapshot; `None` for aggregates,
    /// multi-entry snapshots and non-numeric values.
    #[must_use]
    pub fn numeric_value(&self) -> Option<f64> {
        match self.entries.as_slice() {
            [entry] => entry.value.as_numeric(),
            _ => None,
        }
    }

    /// True iff serializing this snapshot needs a hierarchical payload format
    /// (more than one value, an aggregate, or a non-leaf root).
    #[must_use]
    pub fn requires_hierarchical_format(&self) -> bool {
        match self.entries.as_slice() {
            [entry] => matches!(entry.value, Value::StartAggregate),
            _ => true,
        }
    }
}

/// Accumulates entries and compiles them into an immutable [`Batch`].
#[derive(Debug, Default)]
pub struct BatchBuilder {
    entries: Vec<BatchEntry>,
}

impl BatchBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> BatchBuilder {
        BatchBuilder::default()
    }

    /// Appends an entry.
    pub fn add(&mut self, entry: BatchEntry) {
        self.entries.push(entry);
    }

    /// Number of accumulated entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff nothing has been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compiles the accumulated entries, stamping the snapshot with `now`.
    #[must_use]
    pub fn compile(self, now: Instant) -> SharedBatch {
        Rc::new(Batch {
            compiled_at: now,
            entries: self.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(value: Value, now: Instant) -> SharedBatch {
        let mut builder = BatchBuilder::new();
        builder.add(BatchEntry::new(Path::resource(42, 69, 4), value));
        builder.compile(now)
    }

    #[test]
    fn values_equal_ignores_timestamps() {
        let now = Instant::now();
        let later = now + std::time::Duration::from_secs(60);
        let a = single(Value::Int(514), now);
        let b = single(Value::Int(514), later);
        let c = single(Value::Int(515), later);

        assert!(a.values_equal(&b));
        assert!(!a.values_equal(&c));
    }

    #[test]
    fn numeric_projection() {
        let now = Instant::now();
        assert_eq!(single(Value::Int(-3), now).numeric_value(), Some(-3.0));
        assert_eq!(single(Value::Double(1.5), now).numeric_value(), Some(1.5));
        assert_eq!(
            single(Value::Str("nope".into()), now).numeric_value(),
            None
        );

        let mut builder = BatchBuilder::new();
        builder.add(BatchEntry::new(Path::resource(3, 0, 1), Value::Int(1)));
        builder.add(BatchEntry::new(Path::resource(3, 0, 2), Value::Int(2)));
        assert_eq!(builder.compile(now).numeric_value(), None);
    }

    #[test]
    fn hierarchical_format_detection() {
        let now = Instant::now();
        assert!(!single(Value::Int(1), now).requires_hierarchical_format());
        assert!(single(Value::StartAggregate, now).requires_hierarchical_format());

        let mut builder = BatchBuilder::new();
        builder.add(BatchEntry::new(Path::resource(3, 0, 1), Value::Int(1)));
        builder.add(BatchEntry::new(Path::resource(3, 0, 2), Value::Int(2)));
        assert!(builder.compile(now).requires_hierarchical_format());
    }
}
