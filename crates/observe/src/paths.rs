// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Matching changed paths against the sorted registered-path index.
//!
//! Both sides may be "wildcarded": an observation may be registered at any
//! depth (object, instance, resource, resource instance), and a change
//! notification may likewise address any depth. A registered entry matches
//! iff it lies on the same root-to-leaf chain as the changed path.
//!
//! With the absent marker sorting last, the sorted index makes this cheap:
//! for every proper prefix of the changed path one exact lookup finds the
//! entry registered at that prefix, and a single bounded range scan finds
//! every entry at the changed path itself or below it.

use crate::connection::ConnectionEntry;
use lwm2m_core::{Path, Token};

/// Collects `(registered path, observing tokens)` for every index entry
/// matching `path`.
pub(crate) fn matching_entries(conn: &ConnectionEntry, path: &Path) -> Vec<(Path, Vec<Token>)> {
    let mut out = Vec::new();

    // Entries registered above the changed path: one exact probe per prefix
    // length (including the root entry).
    for level in 0..path.len() {
        let key = path.wildcard_from(level);
        if let Some(entry) = conn.observed_paths.get(&key) {
            out.push((key, entry.refs.clone()));
        }
    }

    // Entries at the changed path or anywhere below it: since the absent
    // marker is u16::MAX, the inclusive range [path filled with zeros, path]
    // covers exactly that subtree.
    let lower = path.filled(0);
    let upper = *path;
    for (entry_path, entry) in conn.observed_paths.range(lower..=upper) {
        out.push((*entry_path, entry.refs.clone()));
    }

    out
}
