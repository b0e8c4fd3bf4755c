// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! The observe/notify engine.
//!
//! A per-`(server, connection-type)` registry of active observations drives
//! three cooperating mechanisms:
//!
//! - **trigger scheduling** — at most one pending trigger per observation,
//!   armed from `pmax` periods and `notify_changed` events, never delaying an
//!   already-earlier trigger;
//! - **the storing queue** — one unsent FIFO per connection with an optional
//!   global cap (evicting the globally-oldest entry) and a per-server
//!   "notification storing" switch deciding whether values survive offline
//!   periods (error values always do);
//! - **delivery** — one in-flight notify exchange per connection, fed by a
//!   streaming serialization cursor, with confirmable promotion at least once
//!   a day and the recoverable-vs-fatal send-error split.
//!
//! All state lives on the scheduler thread; the async [`runtime`] wrapper
//! drives timers and routes commands into the engine.

pub mod config;
pub mod connection;
pub mod engine;
pub mod payload;
pub mod runtime;
pub mod serialize;
pub mod testing;

mod paths;
mod trigger;

pub use config::{ObserveConfig, StoredNotificationLimit};
pub use connection::{ConnRef, ConnectionKind, ObserveAction};
pub use engine::{
    InitialResponse, ObservationStatus, ObserveEngine, ObserveRequest, Transports,
};
pub use runtime::{ObserveCommand, ObserveHandle, observe_channel};
