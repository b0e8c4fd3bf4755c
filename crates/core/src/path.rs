// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! LwM2M data-model paths.
//!
//! A path addresses up to four levels of the data model: Object, Object
//! Instance, Resource and Resource Instance. Any suffix of the four IDs may
//! be absent; `65535` is reserved as the "absent" marker and doubles as a
//! wildcard when paths are used as registry keys.

use std::fmt;

/// Reserved ID value meaning "absent" (and "wildcard" in registry keys).
pub const ID_INVALID: u16 = u16::MAX;

/// Number of addressable levels (Object, Instance, Resource, Resource Instance).
const MAX_DEPTH: usize = 4;

/// Errors produced when constructing a [`Path`] from raw IDs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    /// A present ID followed an absent one (e.g. `/3/65535/1`).
    #[error("present id at level {level} follows an absent one")]
    Hole {
        /// Zero-based level of the offending ID.
        level: usize,
    },
}

/// An LwM2M data-model path.
///
/// Paths order lexicographically over their four IDs, which makes absent
/// components sort after every concrete ID. This is the ordering used by the
/// observe engine's sorted path registry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    ids: [u16; MAX_DEPTH],
}

impl Path {
    /// The root path (`/`), all components absent.
    pub const ROOT: Path = Path {
        ids: [ID_INVALID; MAX_DEPTH],
    };

    /// Creates an Object path.
    #[must_use]
    pub const fn object(oid: u16) -> Path {
        Path {
            ids: [oid, ID_INVALID, ID_INVALID, ID_INVALID],
        }
    }

    /// Creates an Object Instance path.
    #[must_use]
    pub const fn instance(oid: u16, iid: u16) -> Path {
        Path {
            ids: [oid, iid, ID_INVALID, ID_INVALID],
        }
    }

    /// Creates a Resource path.
    #[must_use]
    pub const fn resource(oid: u16, iid: u16, rid: u16) -> Path {
        Path {
            ids: [oid, iid, rid, ID_INVALID],
        }
    }

    /// Creates a Resource Instance path.
    #[must_use]
    pub const fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Path {
        Path {
            ids: [oid, iid, rid, riid],
        }
    }

    /// Builds a path from raw IDs, rejecting "holes" (a present ID after an
    /// absent one).
    pub fn from_ids(ids: [u16; 4]) -> Result<Path, PathError> {
        let mut absent_seen = false;
        for (level, &id) in ids.iter().enumerate() {
            if id == ID_INVALID {
                absent_seen = true;
            } else if absent_seen {
                return Err(PathError::Hole { level });
            }
        }
        Ok(Path { ids })
    }

    /// Number of present components (0 for the root path).
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.iter().position(|&id| id == ID_INVALID).unwrap_or(MAX_DEPTH)
    }

    /// True iff no component is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff the component at `level` (0 = Object) is present.
    #[must_use]
    pub fn has(&self, level: usize) -> bool {
        level < MAX_DEPTH && self.ids[level] != ID_INVALID
    }

    /// The component at `level`, if present.
    #[must_use]
    pub fn id(&self, level: usize) -> Option<u16> {
        match self.ids.get(level) {
            Some(&id) if id != ID_INVALID => Some(id),
            _ => None,
        }
    }

    /// The Object ID, if present.
    #[must_use]
    pub fn oid(&self) -> Option<u16> {
        self.id(0)
    }

    /// The Object Instance ID, if present.
    #[must_use]
    pub fn iid(&self) -> Option<u16> {
        self.id(1)
    }

    /// The Resource ID, if present.
    #[must_use]
    pub fn rid(&self) -> Option<u16> {
        self.id(2)
    }

    /// The Resource Instance ID, if present.
    #[must_use]
    pub fn riid(&self) -> Option<u16> {
        self.id(3)
    }

    /// Returns this path truncated to at most `len` components.
    #[must_use]
    pub fn truncated(&self, len: usize) -> Path {
        let mut ids = self.ids;
        for id in ids.iter_mut().skip(len) {
            *id = ID_INVALID;
        }
        Path { ids }
    }

    /// Returns this path with every component from `level` on replaced by the
    /// absent marker, i.e. the registry key that observes the whole subtree.
    #[must_use]
    pub fn wildcard_from(&self, level: usize) -> Path {
        self.truncated(level)
    }

    /// Returns this path with every absent component replaced by `fill`.
    ///
    /// Used to derive inclusive lower/upper bounds for range scans over a
    /// sorted path registry.
    #[must_use]
    pub fn filled(&self, fill: u16) -> Path {
        let mut ids = self.ids;
        for id in ids.iter_mut() {
            if *id == ID_INVALID {
                *id = fill;
            }
        }
        Path { ids }
    }

    /// True iff every present component of `self` equals the corresponding
    /// component of `other`; absent components of `self` match anything.
    ///
    /// An Object-level path covers every Instance/Resource/Resource Instance
    /// below it; a Resource-level path covers every Resource Instance below.
    #[must_use]
    pub fn covers(&self, other: &Path) -> bool {
        let len = self.len();
        len <= other.len() && self.ids[..len] == other.ids[..len]
    }

    /// True iff `self` and `other` lie on one root-to-leaf chain, i.e. either
    /// covers the other. This is the match relation between registered
    /// observation paths and changed-value notifications.
    #[must_use]
    pub fn matches(&self, other: &Path) -> bool {
        self.covers(other) || other.covers(self)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "/");
        }
        for level in 0..self.len() {
            write!(f, "/{}", self.ids[level])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
