// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-connection observe state: the observation registry, the registered
//! path index and the unsent-notification FIFO.
//!
//! Ownership is deliberately one-directional: observations are owned by their
//! connection entry and keyed by token; path entries refer back to
//! observations by token only, and an observation's `last_unsent` refers into
//! the FIFO by sequence number. No cycles, no dangling pointers to repair on
//! mutation beyond plain integer bookkeeping.

use lwm2m_coap::{ExchangeId, ReliabilityHint, ResponseHeader};
use lwm2m_core::{Path, SharedBatch, Ssid, Token};
use lwm2m_sched::JobHandle;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

/// Which transport of a server a connection entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionKind {
    /// The server's primary connection.
    Primary,
    /// The auxiliary trigger connection (e.g. SMS wake-up channel).
    Trigger,
}

/// Identity of a connection: server plus transport role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnRef {
    /// Short Server ID.
    pub ssid: Ssid,
    /// Transport role.
    pub kind: ConnectionKind,
}

impl ConnRef {
    /// Shorthand for a server's primary connection.
    #[must_use]
    pub const fn primary(ssid: Ssid) -> ConnRef {
        ConnRef {
            ssid,
            kind: ConnectionKind::Primary,
        }
    }
}

/// How an observation was issued; decides the serialization root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveAction {
    /// Plain Observe on a single path.
    Read,
    /// Observe-Composite over any number of paths.
    CompositeRead,
}

/// One queued or delivered notification value.
#[derive(Clone, Debug)]
pub(crate) struct ObservationValue {
    /// Response code and content format.
    pub details: ResponseHeader,
    /// Requested reliability; may be promoted to confirmable at flush time.
    pub reliability: ReliabilityHint,
    /// Enqueue time; the unsent FIFO is ordered by it.
    pub timestamp: Instant,
    /// One batch per observation path; empty for error values.
    pub batches: Vec<SharedBatch>,
}

impl ObservationValue {
    pub(crate) fn is_error(&self) -> bool {
        self.details.code.is_error()
    }
}

/// An element of the unsent FIFO. Sequence numbers are engine-global and
/// strictly increasing, so they double as stable references into the queue.
#[derive(Debug)]
pub(crate) struct QueuedValue {
    pub seq: u64,
    pub token: Token,
    pub value: ObservationValue,
}

/// An active observation. Identity fields are fixed at construction; the
/// token lives as the registry key.
#[derive(Debug)]
pub(crate) struct Observation {
    pub action: ObserveAction,
    pub paths: Vec<Path>,
    /// Pending trigger, if armed.
    pub notify_task: Option<JobHandle>,
    /// When the next pmax-driven trigger is expected; planning metadata only.
    pub next_pmax_trigger: Option<Instant>,
    /// When the last confirmable notification was delivered.
    pub last_confirmable: Instant,
    /// The single last delivered value.
    pub last_sent: Option<ObservationValue>,
    /// Sequence number of this observation's newest entry in the connection's
    /// unsent FIFO, if any.
    pub last_unsent: Option<u64>,
}

impl Observation {
    /// The serialization root: the observed path for plain Observe, the data
    /// model root for composites.
    pub(crate) fn root_path(&self) -> Path {
        match self.action {
            ObserveAction::Read => self.paths.first().copied().unwrap_or(Path::ROOT),
            ObserveAction::CompositeRead => Path::ROOT,
        }
    }
}

/// A registered path with back-references (by token) to the observations that
/// include it; the fan-out index for `notify_changed`.
#[derive(Debug, Default)]
pub(crate) struct PathEntry {
    pub refs: Vec<Token>,
}

/// Everything the engine keeps per `(server, connection-type)`.
#[derive(Debug, Default)]
pub(crate) struct ConnectionEntry {
    pub observations: BTreeMap<Token, Observation>,
    pub observed_paths: BTreeMap<Path, PathEntry>,
    /// Pending flush job, if scheduled.
    pub flush_task: Option<JobHandle>,
    /// The in-flight notify exchange; valid iff a notification is being sent,
    /// in which case it carries the head of `unsent`.
    pub notify_exchange: Option<ExchangeId>,
    /// Unsent values in enqueue order.
    pub unsent: VecDeque<QueuedValue>,
}

impl ConnectionEntry {
    /// The newest value of an observation: its tail entry in the unsent FIFO
    /// if one exists, its last delivered value otherwise.
    pub fn newest_value(&self, token: &Token) -> Option<&ObservationValue> {
        let observation = self.observations.get(token)?;
        if let Some(seq) = observation.last_unsent {
            return self.queued(seq).map(|queued| &queued.value);
        }
        observation.last_sent.as_ref()
    }

    /// Looks up a queued value by sequence number.
    pub fn queued(&self, seq: u64) -> Option<&QueuedValue> {
        // The FIFO is sorted by seq (enqueue order).
        let index = self
            .unsent
            .binary_search_by_key(&seq, |queued| queued.seq)
            .ok()?;
        self.unsent.get(index)
    }

    /// Appends a freshly-built value for `token`.
    pub fn push_value(&mut self, queued: QueuedValue) {
        if let Some(observation) = self.observations.get_mut(&queued.token) {
            observation.last_unsent = Some(queued.seq);
        }
        self.unsent.push_back(queued);
    }

    /// Detaches the head of the unsent FIFO, clearing the owning
    /// observation's `last_unsent` if it pointed at the head.
    pub fn detach_first_unsent(&mut self) -> Option<QueuedValue> {
        let queued = self.unsent.pop_front()?;
        if let Some(observation) = self.observations.get_mut(&queued.token) {
            if observation.last_unsent == Some(queued.seq) {
                observation.last_unsent = None;
            }
        }
        Some(queued)
    }

    /// Completes delivery of the head entry: it becomes the owning
    /// observation's single `last_sent`, replacing any previous one.
    pub fn value_sent(&mut self) {
        if let Some(queued) = self.detach_first_unsent() {
            if let Some(observation) = self.observations.get_mut(&queued.token) {
                observation.last_sent = Some(queued.value);
            }
        }
    }

    /// Drops every queued non-error value; error values must still be
    /// delivered. `last_unsent` references are recomputed.
    pub fn drop_unsent_non_errors(&mut self) {
        self.unsent.retain(|queued| queued.value.is_error());
        for observation in self.observations.values_mut() {
            observation.last_unsent = None;
        }
        let mut newest: BTreeMap<Token, u64> = BTreeMap::new();
        for queued in &self.unsent {
            let _ = newest.insert(queued.token, queued.seq);
        }
        for (token, seq) in newest {
            if let Some(observation) = self.observations.get_mut(&token) {
                observation.last_unsent = Some(seq);
            }
        }
    }

    /// Removes every queued value belonging to `token`.
    pub fn purge_values_of(&mut self, token: &Token) {
        self.unsent.retain(|queued| queued.token != *token);
    }

    /// Enqueue timestamp of the FIFO head.
    pub fn head_timestamp(&self) -> Option<Instant> {
        self.unsent.front().map(|queued| queued.value.timestamp)
    }

    /// True iff nothing is registered on this connection any more.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}
