// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Data-model primitives shared by every crate in the workspace.
//!
//! The types here are deliberately free of any I/O or protocol machinery:
//! paths and tokens are plain ordered values, attributes are a per-field
//! option set with a fixed inheritance chain, and batches are immutable
//! snapshots of data-model reads. Everything protocol-shaped lives in
//! `lwm2m-coap` and above.

pub mod attributes;
pub mod batch;
pub mod path;
pub mod token;

pub use attributes::{AttributeError, Attributes, ConAttr, RawAttributes};
pub use batch::{Batch, BatchBuilder, BatchEntry, SharedBatch, Value};
pub use path::{ID_INVALID, Path, PathError};
pub use token::{Token, TokenError};

/// Short Server ID identifying an LwM2M server in the data model.
pub type Ssid = u16;

/// Reserved SSID matching any server.
pub const SSID_ANY: Ssid = u16::MAX;
