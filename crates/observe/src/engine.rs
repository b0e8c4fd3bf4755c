// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! The observe engine proper: registry, triggers, storing queue and delivery.

use crate::config::{ObserveConfig, StoredNotificationLimit};
use crate::connection::{
    ConnRef, ConnectionEntry, ObservationValue, ObserveAction, Observation, QueuedValue,
};
use crate::paths::matching_entries;
use crate::serialize::SerializationCursor;
use crate::trigger::{
    epmin_expired, fold_min_pmax, pmax_expired, reliability_from_con, should_update_value,
};
use lwm2m_coap::{
    Code, ContentFormat, ObserveId, PayloadSource, ReliabilityHint, ResponseHeader, ServerExchange,
    SocketError, TransportError,
};
use lwm2m_core::{ConAttr, Path, Ssid, Token};
use lwm2m_dm::{DataModel, DmError, effective_attrs, read_path};
use lwm2m_sched::{JobQueue, earliest};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const DAY: Duration = Duration::from_secs(86_400);

/// Transport-state queries and connection control the engine needs from its
/// host. One implementation typically fronts the client's server registry.
pub trait Transports {
    /// The CoAP context bound to a connection, if one currently exists.
    fn exchange(&mut self, conn: ConnRef) -> Option<&mut dyn ServerExchange>;

    /// True iff the connection is allowed to send right now (not suspended or
    /// mid-reconnect).
    fn ready_for_outgoing(&self, conn: ConnRef) -> bool;

    /// True iff the connection's transport is usable at all.
    fn transport_online(&self, conn: ConnRef) -> bool;

    /// True iff the connection's socket is up (false while a queue-mode
    /// connection sleeps).
    fn socket_online(&self, conn: ConnRef) -> bool;

    /// True iff the server operates in queue mode.
    fn queue_mode(&self, conn: ConnRef) -> bool;

    /// Asks the host to bring a queue-mode connection online. Once it is up,
    /// the host calls [`ObserveEngine::schedule_flush`].
    fn bring_online(&mut self, conn: ConnRef);

    /// Reports a connection-level send failure; the host owns rebind and
    /// reconnect policy.
    fn on_communication_error(&mut self, conn: ConnRef, error: &TransportError);
}

/// A decoded Observe request (`observe = 0`).
#[derive(Clone, Debug)]
pub struct ObserveRequest {
    /// The request token; doubles as the observation identity.
    pub token: Token,
    /// Plain or composite read.
    pub action: ObserveAction,
    /// Observed paths; exactly one for [`ObserveAction::Read`].
    pub paths: Vec<Path>,
    /// Requested response format, if the request carried Accept.
    pub accept: Option<ContentFormat>,
}

/// The synchronous response to an Observe request, sent whether or not the
/// observation was installed (RFC 7641 §4.1: serve the read regardless).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialResponse {
    /// Response code.
    pub code: Code,
    /// Content format of `payload`, when the read succeeded.
    pub format: Option<ContentFormat>,
    /// Serialized initial value (empty on errors).
    pub payload: Vec<u8>,
}

/// Aggregate observation state of one resource, for data sources that want
/// to poll hardware only as often as somebody listens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservationStatus {
    /// True iff any observation covers the resource.
    pub is_observed: bool,
    /// Smallest effective `pmin` over all covering registrations.
    pub min_period: Option<u32>,
    /// Smallest effective `epmax` over all covering registrations.
    pub max_eval_period: Option<u32>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ObserveJob {
    Trigger { conn: ConnRef, token: Token },
    Flush { conn: ConnRef },
}

/// The observe engine. Owns all observe state; every method runs on the
/// scheduler thread.
pub struct ObserveEngine<M, T> {
    dm: M,
    transports: T,
    config: ObserveConfig,
    sched: JobQueue<ObserveJob>,
    connections: BTreeMap<ConnRef, ConnectionEntry>,
    next_seq: u64,
}

impl<M: DataModel, T: Transports> ObserveEngine<M, T> {
    /// Creates an engine over the given collaborators.
    pub fn new(dm: M, transports: T, config: ObserveConfig) -> ObserveEngine<M, T> {
        ObserveEngine {
            dm,
            transports,
            config,
            sched: JobQueue::new(),
            connections: BTreeMap::new(),
            next_seq: 1,
        }
    }

    /// The transports collaborator, e.g. for hosts reacting to engine
    /// callbacks.
    pub fn transports_mut(&mut self) -> &mut T {
        &mut self.transports
    }

    // ---------------------------------------------------------------- registry

    /// Handles an Observe request: registers (or replaces) the observation,
    /// snapshots the initial value and returns the synchronous response.
    pub fn handle_observe(
        &mut self,
        conn_ref: ConnRef,
        request: ObserveRequest,
        now: Instant,
    ) -> InitialResponse {
        if request.paths.is_empty()
            || (request.action == ObserveAction::Read && request.paths.len() != 1)
        {
            return InitialResponse {
                code: Code::BAD_REQUEST,
                format: None,
                payload: Vec::new(),
            };
        }
        let _ = self.connections.entry(conn_ref).or_default();

        let mut batches = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            match read_path(&self.dm, path, now) {
                Ok(batch) => batches.push(batch),
                Err(err) => {
                    debug!(%path, %err, "observe read failed");
                    self.prune_if_empty(conn_ref);
                    return InitialResponse {
                        code: err.response_code(),
                        format: None,
                        payload: Vec::new(),
                    };
                }
            }
        }

        let format = request.accept.unwrap_or_else(|| match request.action {
            ObserveAction::CompositeRead => ContentFormat::SenmlJson,
            ObserveAction::Read => {
                if request.paths[0].rid().is_none() || batches[0].requires_hierarchical_format() {
                    ContentFormat::SenmlJson
                } else {
                    ContentFormat::PlainText
                }
            }
        });
        let details = ResponseHeader {
            code: Code::CONTENT,
            format: Some(format),
        };

        // Re-issuing Observe with a known token replaces the observation.
        let replacing = self
            .connections
            .get(&conn_ref)
            .is_some_and(|conn| conn.observations.contains_key(&request.token));
        if replacing {
            trace!(token = %request.token, "replacing existing observation");
            self.remove_observation(conn_ref, request.token, false);
        }

        let root = match request.action {
            ObserveAction::Read => request.paths[0],
            ObserveAction::CompositeRead => Path::ROOT,
        };
        {
            let conn = self.connections.entry(conn_ref).or_default();
            let observation = Observation {
                action: request.action,
                paths: request.paths.clone(),
                notify_task: None,
                next_pmax_trigger: None,
                last_confirmable: now,
                // The initial value counts as sent even though the response
                // is delivered by the caller.
                last_sent: Some(ObservationValue {
                    details,
                    reliability: ReliabilityHint::PreferNonConfirmable,
                    timestamp: now,
                    batches: batches.clone(),
                }),
                last_unsent: None,
            };
            let _ = conn.observations.insert(request.token, observation);
            for path in &request.paths {
                let entry = conn.observed_paths.entry(*path).or_default();
                if !entry.refs.contains(&request.token) {
                    entry.refs.push(request.token);
                }
            }
        }

        let mut install_ok = true;
        if let Err(err) = self.schedule_pmax_trigger(conn_ref, request.token, now) {
            debug!(%err, "could not arm initial pmax trigger");
            install_ok = false;
        }
        match self.transports.exchange(conn_ref) {
            Some(exchange) => {
                if let Err(err) = exchange.observe_start(ObserveId {
                    token: request.token,
                }) {
                    warn!(%err, "exchange layer refused observation");
                    install_ok = false;
                }
            }
            None => install_ok = false,
        }

        let payload = SerializationCursor::new(root, format, batches)
            .and_then(SerializationCursor::drain);
        match payload {
            Ok(payload) => {
                if !install_ok {
                    // Could not register, but the read succeeded: respond as
                    // if this were a plain Read.
                    self.remove_observation(conn_ref, request.token, true);
                }
                InitialResponse {
                    code: Code::CONTENT,
                    format: Some(format),
                    payload,
                }
            }
            Err(err) => {
                warn!(%err, "initial value serialization failed");
                self.remove_observation(conn_ref, request.token, true);
                InitialResponse {
                    code: Code::INTERNAL_SERVER_ERROR,
                    format: None,
                    payload: Vec::new(),
                }
            }
        }
    }

    /// Handles observation cancellation (`observe = 1` on a known token, or
    /// the exchange layer's cancel callback).
    pub fn handle_cancel(&mut self, conn_ref: ConnRef, token: Token) {
        trace!(%token, "cancelling observation");
        self.remove_observation(conn_ref, token, true);
    }

    /// Re-evaluates all observations whose server matches `ssid` (or does
    /// not, with `invert_match`) and whose registered paths match `path`.
    /// Matched observations are triggered after their effective `pmin`.
    pub fn notify_changed(&mut self, path: &Path, ssid: Ssid, invert_match: bool, now: Instant) {
        let conn_refs: Vec<ConnRef> = self.connections.keys().copied().collect();
        for conn_ref in conn_refs {
            if (conn_ref.ssid == ssid) == invert_match {
                continue;
            }
            let matches = match self.connections.get(&conn_ref) {
                Some(conn) => matching_entries(conn, path),
                None => continue,
            };
            for (entry_path, tokens) in matches {
                let pmin = effective_attrs(&self.dm, &entry_path, conn_ref.ssid)
                    .map(|attrs| attrs.effective_pmin())
                    .unwrap_or(0);
                for token in tokens {
                    let _ = self.schedule_trigger(conn_ref, token, pmin, now);
                }
            }
        }
    }

    /// Removes connection entries whose server no longer exists. Both the
    /// server list and the connection map are sorted by SSID, so this is one
    /// linear lockstep walk.
    pub fn gc(&mut self) {
        let mut active = self.dm.active_servers().into_iter().peekable();
        let mut doomed = Vec::new();
        for conn_ref in self.connections.keys().copied() {
            while active.next_if(|&ssid| ssid < conn_ref.ssid).is_some() {}
            if active.peek() != Some(&conn_ref.ssid) {
                doomed.push(conn_ref);
            }
        }
        for conn_ref in doomed {
            debug!(ssid = conn_ref.ssid, "garbage-collecting observe state");
            self.remove_connection(conn_ref);
        }
    }

    /// Cancels a connection's pending flush job and in-flight exchange, e.g.
    /// when its transport is being torn down. Stored values stay queued.
    pub fn interrupt(&mut self, conn_ref: ConnRef) {
        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return;
        };
        if let Some(handle) = conn.flush_task.take() {
            trace!(ssid = conn_ref.ssid, "cancelling notification flush job");
            let _ = self.sched.cancel(handle);
        }
        if let Some(id) = conn.notify_exchange.take() {
            trace!(ssid = conn_ref.ssid, "cancelling in-flight notification");
            if let Some(exchange) = self.transports.exchange(conn_ref) {
                let _ = exchange.cancel(id);
            }
        }
    }

    /// Schedules a flush for a connection that just became ready, unless one
    /// is already scheduled or in flight.
    pub fn schedule_flush(&mut self, conn_ref: ConnRef, now: Instant) {
        trace!(ssid = conn_ref.ssid, "scheduling notification flush");
        self.sched_flush(conn_ref, now);
    }

    // ------------------------------------------------------------- planning

    /// The earliest pending trigger over connections of `ssid` (or all).
    pub fn next_planned_trigger(&self, ssid: Option<Ssid>) -> Option<Instant> {
        let mut result = None;
        for (conn_ref, conn) in &self.connections {
            if ssid.is_some_and(|ssid| ssid != conn_ref.ssid) {
                continue;
            }
            for observation in conn.observations.values() {
                let at = observation
                    .notify_task
                    .and_then(|handle| self.sched.scheduled_at(handle));
                result = earliest(result, at);
            }
        }
        result
    }

    /// The earliest expected pmax-driven trigger over connections of `ssid`
    /// (or all).
    pub fn next_planned_pmax_trigger(&self, ssid: Option<Ssid>) -> Option<Instant> {
        let mut result = None;
        for (conn_ref, conn) in &self.connections {
            if ssid.is_some_and(|ssid| ssid != conn_ref.ssid) {
                continue;
            }
            for observation in conn.observations.values() {
                result = earliest(result, observation.next_pmax_trigger);
            }
        }
        result
    }

    /// True iff some matching connection has queued values but neither a
    /// scheduled flush nor an exchange in flight.
    pub fn has_unsent_notifications(&self, ssid: Option<Ssid>) -> bool {
        self.connections.iter().any(|(conn_ref, conn)| {
            ssid.is_none_or(|ssid| ssid == conn_ref.ssid)
                && !conn.unsent.is_empty()
                && conn.flush_task.is_none()
                && conn.notify_exchange.is_none()
        })
    }

    /// Aggregate observation status of one resource.
    pub fn observation_status(&self, oid: u16, iid: u16, rid: u16) -> ObservationStatus {
        let path = Path::resource(oid, iid, rid);
        let mut status = ObservationStatus::default();
        for (conn_ref, conn) in &self.connections {
            for (entry_path, _) in matching_entries(conn, &path) {
                status.is_observed = true;
                if let Ok(attrs) = effective_attrs(&self.dm, &entry_path, conn_ref.ssid) {
                    status.min_period = fold_min(status.min_period, Some(attrs.effective_pmin()));
                    status.max_eval_period = fold_min(status.max_eval_period, attrs.epmax);
                }
            }
        }
        status
    }

    // ------------------------------------------------------------ scheduling

    /// The next timer deadline, for embedding in an event loop.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        self.sched.next_expiry()
    }

    /// Runs every due trigger and flush job.
    pub fn fire_due(&mut self, now: Instant) {
        while let Some(job) = self.sched.pop_due(now) {
            match job {
                ObserveJob::Trigger { conn, token } => self.run_trigger(conn, token, now),
                ObserveJob::Flush { conn } => self.run_flush(conn, now),
            }
        }
    }

    /// Arms a trigger for `token` after `period_secs`, measured from its
    /// newest value. An already-earlier pending trigger is never delayed.
    /// Returns the computed trigger instant.
    fn schedule_trigger(
        &mut self,
        conn_ref: ConnRef,
        token: Token,
        period_secs: u32,
        now: Instant,
    ) -> Option<Instant> {
        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return None;
        };
        let newest_ts = conn.newest_value(&token)?.timestamp;
        let trigger_at = (newest_ts + Duration::from_secs(period_secs.into())).max(now);

        let observation = conn.observations.get_mut(&token)?;
        if let Some(handle) = observation.notify_task {
            if let Some(at) = self.sched.scheduled_at(handle) {
                if at <= trigger_at {
                    trace!(%token, "trigger already scheduled earlier than requested");
                    return Some(trigger_at);
                }
                let _ = self.sched.cancel(handle);
            }
        }
        trace!(%token, ?trigger_at, "trigger scheduled");
        let handle = self.sched.schedule_at(
            trigger_at,
            ObserveJob::Trigger {
                conn: conn_ref,
                token,
            },
        );
        observation.notify_task = Some(handle);
        Some(trigger_at)
    }

    /// Arms the periodic trigger from the minimum valid `pmax` over the
    /// observation's paths, if any.
    fn schedule_pmax_trigger(
        &mut self,
        conn_ref: ConnRef,
        token: Token,
        now: Instant,
    ) -> Result<(), DmError> {
        let Some(conn) = self.connections.get(&conn_ref) else {
            return Ok(());
        };
        let Some(observation) = conn.observations.get(&token) else {
            return Ok(());
        };
        let paths = observation.paths.clone();

        let mut pmax = None;
        for path in &paths {
            let attrs = effective_attrs(&self.dm, path, conn_ref.ssid)?;
            pmax = fold_min_pmax(pmax, &attrs);
        }
        if let Some(pmax) = pmax {
            let at = self.schedule_trigger(conn_ref, token, pmax, now);
            if let Some(conn) = self.connections.get_mut(&conn_ref) {
                if let Some(observation) = conn.observations.get_mut(&token) {
                    observation.next_pmax_trigger = at;
                }
            }
        }
        Ok(())
    }

    fn run_trigger(&mut self, conn_ref: ConnRef, token: Token, now: Instant) {
        {
            let Some(conn) = self.connections.get_mut(&conn_ref) else {
                return;
            };
            let Some(observation) = conn.observations.get_mut(&token) else {
                return;
            };
            observation.notify_task = None;
        }

        let ready = self.transports.ready_for_outgoing(conn_ref)
            && self.transports.transport_online(conn_ref);
        let storing = self.dm.notification_storing(conn_ref.ssid);

        if ready || storing {
            if let Err(err) = self.update_notification_value(conn_ref, token, now) {
                warn!(%err, %token, "could not refresh observed value");
                self.insert_error(conn_ref, token, err.response_code(), now);
            }
        }

        let (has_unsent, exchange_free) = match self.connections.get(&conn_ref) {
            Some(conn) => (!conn.unsent.is_empty(), conn.notify_exchange.is_none()),
            None => return,
        };
        if ready && has_unsent && exchange_free {
            if let Some(conn) = self.connections.get_mut(&conn_ref) {
                if let Some(handle) = conn.flush_task.take() {
                    let _ = self.sched.cancel(handle);
                }
            }
            if self.transports.socket_online(conn_ref) {
                self.flush_next_unsent(conn_ref, now);
            } else if self.transports.queue_mode(conn_ref) {
                // Once the connection is up, the host calls schedule_flush().
                self.transports.bring_online(conn_ref);
            } else if !storing {
                if let Some(conn) = self.connections.get_mut(&conn_ref) {
                    conn.drop_unsent_non_errors();
                }
            }
        }
    }

    /// Re-reads the observation's paths (honouring `epmin`) and enqueues a
    /// new value if the update conditions say so; then re-arms the pmax
    /// trigger.
    fn update_notification_value(
        &mut self,
        conn_ref: ConnRef,
        token: Token,
        now: Instant,
    ) -> Result<(), DmError> {
        let (paths, details, newest_ts, prev_batches) = {
            let Some(conn) = self.connections.get(&conn_ref) else {
                return Ok(());
            };
            let Some(observation) = conn.observations.get(&token) else {
                return Ok(());
            };
            let Some(newest) = conn.newest_value(&token) else {
                return Ok(());
            };
            if newest.is_error() {
                return Ok(());
            }
            (
                observation.paths.clone(),
                newest.details,
                newest.timestamp,
                newest.batches.clone(),
            )
        };

        let mut should_update = false;
        let mut pmax = None;
        let mut con = ConAttr::Unset;
        let mut new_batches = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            let attrs = effective_attrs(&self.dm, path, conn_ref.ssid)?;
            let previous = prev_batches.get(index);
            let batch = match previous {
                Some(previous) if !epmin_expired(previous, &attrs, now) => {
                    trace!(%path, "epmin holds off a re-read");
                    previous.clone()
                }
                _ => read_path(&self.dm, path, now)?,
            };
            if !should_update
                && (pmax_expired(newest_ts, &attrs, now)
                    || previous.is_none_or(|previous| {
                        should_update_value(path, &attrs, previous, &batch)
                    }))
            {
                should_update = true;
            }
            pmax = fold_min_pmax(pmax, &attrs);
            con = con.max(attrs.con);
            new_batches.push(batch);
        }

        if should_update {
            let reliability = reliability_from_con(con, &self.config);
            self.insert_value(conn_ref, token, reliability, details, new_batches, now);
        }
        if let Some(pmax) = pmax {
            let at = self.schedule_trigger(conn_ref, token, pmax, now);
            if let Some(conn) = self.connections.get_mut(&conn_ref) {
                if let Some(observation) = conn.observations.get_mut(&token) {
                    observation.next_pmax_trigger = at;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------- storing queue

    fn count_queued(&self) -> usize {
        self.connections.values().map(|conn| conn.unsent.len()).sum()
    }

    /// Evicts the globally-oldest queued entry. Connections with an exchange
    /// in flight are exempt: their head is being transmitted right now.
    /// Returns `false` if nothing could be evicted.
    fn drop_oldest_queued(&mut self) -> bool {
        let oldest = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.notify_exchange.is_none())
            .filter_map(|(conn_ref, conn)| {
                conn.head_timestamp().map(|timestamp| (timestamp, *conn_ref))
            })
            .min_by_key(|(timestamp, _)| *timestamp)
            .map(|(_, conn_ref)| conn_ref);
        if let Some(conn_ref) = oldest {
            if let Some(conn) = self.connections.get_mut(&conn_ref) {
                trace!(ssid = conn_ref.ssid, "dropping oldest stored notification");
                drop(conn.detach_first_unsent());
                return true;
            }
        }
        false
    }

    fn insert_value(
        &mut self,
        conn_ref: ConnRef,
        token: Token,
        reliability: ReliabilityHint,
        details: ResponseHeader,
        batches: Vec<lwm2m_core::SharedBatch>,
        now: Instant,
    ) {
        if let StoredNotificationLimit::DropOldest { limit } = self.config.stored_notification_limit
        {
            while self.count_queued() >= limit {
                if !self.drop_oldest_queued() {
                    break;
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(conn) = self.connections.get_mut(&conn_ref) {
            conn.push_value(QueuedValue {
                seq,
                token,
                value: ObservationValue {
                    details,
                    reliability,
                    timestamp: now,
                    batches,
                },
            });
        }
    }

    /// Enqueues an error value for `token` (always confirmable, no payload)
    /// and cancels its pending trigger.
    fn insert_error(&mut self, conn_ref: ConnRef, token: Token, code: Code, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&conn_ref) {
            if let Some(observation) = conn.observations.get_mut(&token) {
                if let Some(handle) = observation.notify_task.take() {
                    let _ = self.sched.cancel(handle);
                }
            }
        }
        self.insert_value(
            conn_ref,
            token,
            ReliabilityHint::PreferConfirmable,
            ResponseHeader { code, format: None },
            Vec::new(),
            now,
        );
    }

    // -------------------------------------------------------------- delivery

    fn sched_flush(&mut self, conn_ref: ConnRef, now: Instant) {
        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return;
        };
        if conn.flush_task.is_some() || conn.notify_exchange.is_some() {
            trace!("skipping flush scheduling: already scheduled or in flight");
            return;
        }
        let handle = self.sched.schedule_at(now, ObserveJob::Flush { conn: conn_ref });
        conn.flush_task = Some(handle);
    }

    fn run_flush(&mut self, conn_ref: ConnRef, now: Instant) {
        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return;
        };
        conn.flush_task = None;
        if conn.unsent.is_empty() || conn.notify_exchange.is_some() {
            return;
        }
        if self.transports.ready_for_outgoing(conn_ref) && self.transports.socket_online(conn_ref)
        {
            self.flush_next_unsent(conn_ref, now);
        }
    }

    /// Starts the notify exchange for the head of the unsent FIFO. The head
    /// stays queued until delivery completes.
    fn flush_next_unsent(&mut self, conn_ref: ConnRef, now: Instant) {
        let (token, details, mut reliability, is_error, batches, root, last_confirmable) = {
            let Some(conn) = self.connections.get(&conn_ref) else {
                return;
            };
            debug_assert!(conn.notify_exchange.is_none());
            let Some(head) = conn.unsent.front() else {
                return;
            };
            let Some(observation) = conn.observations.get(&head.token) else {
                return;
            };
            (
                head.token,
                head.value.details,
                head.value.reliability,
                head.value.is_error(),
                head.value.batches.clone(),
                observation.root_path(),
                observation.last_confirmable,
            )
        };

        let max_transmit_wait = match self.transports.exchange(conn_ref) {
            Some(exchange) => exchange.max_transmit_wait(),
            None => {
                let err = SocketError::Io(std::io::ErrorKind::NotConnected.into());
                self.on_entry_flushed(conn_ref, Err(err.into()), now);
                return;
            }
        };

        // At least one confirmable notification per ~24 hours.
        let confirmable_due =
            last_confirmable + DAY.saturating_sub(max_transmit_wait);
        if now >= confirmable_due && reliability != ReliabilityHint::PreferConfirmable {
            reliability = ReliabilityHint::PreferConfirmable;
            if let Some(conn) = self.connections.get_mut(&conn_ref) {
                if let Some(head) = conn.unsent.front_mut() {
                    head.value.reliability = reliability;
                }
            }
        }

        let payload: Option<Box<dyn PayloadSource>> = if is_error {
            None
        } else {
            let format = details.format.unwrap_or(ContentFormat::PlainText);
            match SerializationCursor::new(root, format, batches) {
                Ok(cursor) => Some(Box::new(cursor)),
                Err(err) => {
                    self.on_entry_flushed(
                        conn_ref,
                        Err(lwm2m_coap::CoapError::PayloadWriter {
                            reason: err.to_string(),
                        }
                        .into()),
                        now,
                    );
                    return;
                }
            }
        };

        let result = match self.transports.exchange(conn_ref) {
            Some(exchange) => exchange.notify(ObserveId { token }, &details, reliability, payload),
            None => Err(SocketError::Io(std::io::ErrorKind::NotConnected.into()).into()),
        };
        match result {
            Ok(id) => {
                if let Some(conn) = self.connections.get_mut(&conn_ref) {
                    conn.notify_exchange = Some(id);
                }
            }
            Err(err) => self.on_entry_flushed(conn_ref, Err(err), now),
        }
    }

    /// Reports completion of the in-flight notify exchange.
    pub fn handle_delivery(
        &mut self,
        conn_ref: ConnRef,
        result: Result<(), TransportError>,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return;
        };
        if conn.notify_exchange.take().is_none() {
            trace!("delivery report without an in-flight exchange");
        }
        if result.is_ok() {
            if let Some(head) = conn.unsent.front() {
                let token = head.token;
                let confirmable = head.value.reliability == ReliabilityHint::PreferConfirmable;
                conn.value_sent();
                if confirmable {
                    if let Some(observation) = conn.observations.get_mut(&token) {
                        observation.last_confirmable = now;
                    }
                }
            }
        }
        self.on_entry_flushed(conn_ref, result, now);
    }

    fn on_entry_flushed(
        &mut self,
        conn_ref: ConnRef,
        result: Result<(), TransportError>,
        now: Instant,
    ) {
        match result {
            Ok(()) => {
                let has_unsent = self
                    .connections
                    .get(&conn_ref)
                    .is_some_and(|conn| !conn.unsent.is_empty());
                if has_unsent {
                    self.sched_flush(conn_ref, now);
                } else {
                    self.schedule_all_triggers(conn_ref, now);
                }
            }
            Err(err) if err.handled_by_exchange_layer() => {
                // Peer Reset or local cancellation: the exchange layer has
                // already dealt with the observation.
            }
            Err(err) if !err.is_recoverable_send_error() => {
                warn!(%err, ssid = conn_ref.ssid, "network error while sending notification");
                self.transports.on_communication_error(conn_ref, &err);
            }
            Err(err) => {
                if !self.dm.notification_storing(conn_ref.ssid) {
                    if let Some(conn) = self.connections.get_mut(&conn_ref) {
                        conn.drop_unsent_non_errors();
                    }
                }
                warn!(%err, "could not send notification");
            }
        }
    }

    fn schedule_all_triggers(&mut self, conn_ref: ConnRef, now: Instant) {
        let tokens: Vec<Token> = match self.connections.get(&conn_ref) {
            Some(conn) => conn
                .observations
                .iter()
                .filter(|(_, observation)| observation.notify_task.is_none())
                .map(|(token, _)| *token)
                .collect(),
            None => return,
        };
        for token in tokens {
            if let Err(err) = self.schedule_pmax_trigger(conn_ref, token, now) {
                debug!(%err, %token, "could not re-arm pmax trigger");
            }
        }
    }

    // ------------------------------------------------------------- internals

    fn remove_observation(&mut self, conn_ref: ConnRef, token: Token, prune_connection: bool) {
        if !self.connections.contains_key(&conn_ref) {
            return;
        }
        let exchange_id = self
            .connections
            .get_mut(&conn_ref)
            .and_then(|conn| conn.notify_exchange.take());
        if let Some(exchange) = self.transports.exchange(conn_ref) {
            if let Some(id) = exchange_id {
                let _ = exchange.cancel(id);
            }
            exchange.observe_cancel(ObserveId { token });
        }

        let Some(conn) = self.connections.get_mut(&conn_ref) else {
            return;
        };
        if let Some(observation) = conn.observations.remove(&token) {
            if let Some(handle) = observation.notify_task {
                let _ = self.sched.cancel(handle);
            }
            for path in &observation.paths {
                if let Some(entry) = conn.observed_paths.get_mut(path) {
                    entry.refs.retain(|candidate| candidate != &token);
                    if entry.refs.is_empty() {
                        let _ = conn.observed_paths.remove(path);
                    }
                }
            }
            conn.purge_values_of(&token);
        }
        if prune_connection {
            self.prune_if_empty(conn_ref);
        }
    }

    fn prune_if_empty(&mut self, conn_ref: ConnRef) {
        let empty = self
            .connections
            .get(&conn_ref)
            .is_some_and(ConnectionEntry::is_empty);
        if empty {
            self.remove_connection(conn_ref);
        }
    }

    fn remove_connection(&mut self, conn_ref: ConnRef) {
        let Some(mut conn) = self.connections.remove(&conn_ref) else {
            return;
        };
        if let Some(handle) = conn.flush_task.take() {
            let _ = self.sched.cancel(handle);
        }
        for observation in conn.observations.values_mut() {
            if let Some(handle) = observation.notify_task.take() {
                let _ = self.sched.cancel(handle);
            }
        }
        if let Some(id) = conn.notify_exchange.take() {
            if let Some(exchange) = self.transports.exchange(conn_ref) {
                let _ = exchange.cancel(id);
            }
        }
    }

    // ----------------------------------------------------------- diagnostics

    /// Panics if any internal invariant is violated. Test support.
    pub fn assert_consistent(&self) {
        let mut queued_total = 0;
        for (conn_ref, conn) in &self.connections {
            queued_total += conn.unsent.len();
            let mut last_seq = 0;
            for queued in &conn.unsent {
                assert!(queued.seq > last_seq, "unsent FIFO out of order");
                last_seq = queued.seq;
                assert!(
                    conn.observations.contains_key(&queued.token),
                    "queued value without an owning observation"
                );
            }
            for (token, observation) in &conn.observations {
                if let Some(seq) = observation.last_unsent {
                    let queued = conn.queued(seq).expect("dangling last_unsent");
                    assert_eq!(&queued.token, token, "last_unsent owned by someone else");
                }
            }
            for (path, entry) in &conn.observed_paths {
                assert!(!entry.refs.is_empty(), "empty path entry at {path}");
                for token in &entry.refs {
                    let observation = conn
                        .observations
                        .get(token)
                        .expect("path entry referencing a dead observation");
                    assert!(
                        observation.paths.contains(path),
                        "path entry not backed by the observation's paths"
                    );
                }
            }
            if conn.notify_exchange.is_some() {
                assert!(
                    !conn.unsent.is_empty(),
                    "exchange in flight with an empty queue on ssid {}",
                    conn_ref.ssid
                );
            }
        }
        if let StoredNotificationLimit::DropOldest { limit } = self.config.stored_notification_limit
        {
            assert!(
                queued_total <= limit.max(1),
                "stored notification limit exceeded: {queued_total} > {limit}"
            );
        }
    }
}

fn fold_min(current: Option<u32>, candidate: Option<u32>) -> Option<u32> {
    match (current, candidate) {
        (Some(current), Some(candidate)) => Some(current.min(candidate)),
        (None, candidate) => candidate,
        (current, None) => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestTransports;
    use lwm2m_core::Value;
    use lwm2m_dm::testing::InMemoryModel;
    use lwm2m_core::Attributes;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    const SSID_A: Ssid = 1;
    const SSID_B: Ssid = 2;

    fn token(byte: u8) -> Token {
        Token::new(&[byte]).expect("valid")
    }

    fn resource() -> Path {
        Path::resource(42, 69, 4)
    }

    fn setup() -> (Rc<InMemoryModel>, ObserveEngine<Rc<InMemoryModel>, TestTransports>) {
        let model = Rc::new(InMemoryModel::new());
        model.add_server(SSID_A);
        model.add_single_resource(resource(), Value::Str("514".into()));
        let mut transports = TestTransports::new();
        transports.add_connection(ConnRef::primary(SSID_A));
        let engine = ObserveEngine::new(model.clone(), transports, ObserveConfig::default());
        (model, engine)
    }

    fn observe_request(byte: u8) -> ObserveRequest {
        ObserveRequest {
            token: token(byte),
            action: ObserveAction::Read,
            paths: vec![resource()],
            accept: None,
        }
    }

    fn conn_a() -> ConnRef {
        ConnRef::primary(SSID_A)
    }

    #[tokio::test(start_paused = true)]
    async fn observe_serves_initial_value_and_registers() {
        let (_model, mut engine) = setup();
        let response = engine.handle_observe(conn_a(), observe_request(1), Instant::now());

        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.format, Some(ContentFormat::PlainText));
        assert_eq!(response.payload, b"514");
        assert_eq!(engine.transports_mut().mock(conn_a()).started.len(), 1);
        assert!(engine.observation_status(42, 69, 4).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn observe_read_failure_returns_error_without_registering() {
        let (_model, mut engine) = setup();
        let request = ObserveRequest {
            token: token(1),
            action: ObserveAction::Read,
            paths: vec![Path::resource(42, 69, 99)],
            accept: None,
        };
        let response = engine.handle_observe(conn_a(), request, Instant::now());

        assert_eq!(response.code, Code::NOT_FOUND);
        assert!(response.payload.is_empty());
        assert!(!engine.observation_status(42, 69, 99).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn observe_install_failure_still_serves_the_read() {
        let (_model, mut engine) = setup();
        engine.transports_mut().mock_mut(conn_a()).fail_observe_start = true;
        let response = engine.handle_observe(conn_a(), observe_request(1), Instant::now());

        // RFC 7641 §4.1: the request is processed as a plain read.
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"514");
        assert!(!engine.observation_status(42, 69, 4).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn reissuing_observe_replaces_without_leaking() {
        let (_model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        assert_eq!(engine.transports_mut().mock(conn_a()).started.len(), 2);
        assert_eq!(engine.transports_mut().mock(conn_a()).canceled.len(), 1);
        engine.assert_consistent();

        engine.handle_cancel(conn_a(), token(1));
        assert!(!engine.observation_status(42, 69, 4).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn change_notification_flows_to_the_peer() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        model.set_value(resource(), Value::Str("Hello".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);

        {
            let mock = engine.transports_mut().mock(conn_a());
            assert_eq!(mock.notifications.len(), 1);
            assert_eq!(mock.last_payload_str(), Some("Hello"));
            assert_eq!(
                mock.notifications[0].reliability,
                ReliabilityHint::PreferNonConfirmable
            );
        }
        engine.assert_consistent();

        engine.handle_delivery(conn_a(), Ok(()), now);
        assert!(!engine.has_unsent_notifications(Some(SSID_A)));
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn pmin_delays_triggering() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        model.set_resource_attrs(
            resource(),
            SSID_A,
            Attributes {
                pmin: Some(5),
                ..Attributes::default()
            },
        );
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        model.set_value(resource(), Value::Str("changed".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);
        assert!(engine.transports_mut().mock(conn_a()).notifications.is_empty());

        let expiry = engine.next_expiry().expect("trigger armed");
        assert_eq!(expiry, now + Duration::from_secs(5));
        engine.fire_due(expiry);
        assert_eq!(engine.transports_mut().mock(conn_a()).notifications.len(), 1);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn never_delays_an_earlier_trigger() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        model.set_resource_attrs(
            resource(),
            SSID_A,
            Attributes {
                pmin: Some(5),
                pmax: Some(60),
                ..Attributes::default()
            },
        );
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);
        // pmax armed the trigger at +60; a change re-arms it at +5.
        engine.notify_changed(&resource(), SSID_A, false, now);
        assert_eq!(
            engine.next_planned_trigger(Some(SSID_A)),
            Some(now + Duration::from_secs(5))
        );
        // Another change must not push it back to +5 from a later "now".
        engine.notify_changed(&resource(), SSID_A, false, now + Duration::from_secs(3));
        assert_eq!(
            engine.next_planned_trigger(Some(SSID_A)),
            Some(now + Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queue_limit_evicts_globally_oldest() {
        let model = Rc::new(InMemoryModel::new());
        model.add_server(SSID_A);
        model.add_server(SSID_B);
        model.add_single_resource(resource(), Value::Str("v".into()));
        let mut transports = TestTransports::new();
        transports.add_connection(ConnRef::primary(SSID_A));
        transports.add_connection(ConnRef::primary(SSID_B));
        // Offline, storing: values accumulate.
        transports.state_mut(ConnRef::primary(SSID_A)).ready = false;
        transports.state_mut(ConnRef::primary(SSID_B)).ready = false;
        let config = ObserveConfig {
            stored_notification_limit: StoredNotificationLimit::DropOldest { limit: 2 },
            ..ObserveConfig::default()
        };
        let mut engine = ObserveEngine::new(model.clone(), transports, config);

        let now = Instant::now();
        let _ = engine.handle_observe(ConnRef::primary(SSID_A), observe_request(1), now);
        let _ = engine.handle_observe(ConnRef::primary(SSID_B), observe_request(2), now);

        for (step, text) in ["a", "b", "c"].iter().enumerate() {
            let at = now + Duration::from_secs(step as u64 + 1);
            model.set_value(resource(), Value::Str((*text).into()));
            engine.notify_changed(&resource(), SSID_A, false, at);
            engine.fire_due(at);
            engine.notify_changed(&resource(), SSID_B, false, at);
            engine.fire_due(at);
            engine.assert_consistent();
        }
        // Total stored stays at the cap.
        assert!(engine.has_unsent_notifications(Some(SSID_A)) || engine.has_unsent_notifications(Some(SSID_B)));
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn gc_drops_state_of_vanished_servers() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);
        assert!(engine.observation_status(42, 69, 4).is_observed);

        model.remove_server(SSID_A);
        engine.gc();
        assert!(!engine.observation_status(42, 69, 4).is_observed);
        assert_eq!(engine.next_planned_trigger(None), None);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_during_trigger_enqueues_confirmable_error() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        // Offline with storing enabled: evaluation still happens and the
        // failure is recorded as an error value.
        engine.transports_mut().state_mut(conn_a()).ready = false;

        model.set_present(resource(), false);
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);

        assert!(engine.has_unsent_notifications(Some(SSID_A)));
        engine.assert_consistent();

        // Back online: the stored error is delivered as a confirmable 4.04.
        engine.transports_mut().state_mut(conn_a()).ready = true;
        engine.schedule_flush(conn_a(), now);
        engine.fire_due(now);
        let mock = engine.transports_mut().mock(conn_a());
        assert_eq!(mock.notifications.len(), 1);
        assert_eq!(mock.notifications[0].code, Code::NOT_FOUND);
        assert_eq!(
            mock.notifications[0].reliability,
            ReliabilityHint::PreferConfirmable
        );
        assert!(mock.notifications[0].payload.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_send_error_keeps_the_observation() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        model.set_value(resource(), Value::Str("x".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine
            .transports_mut()
            .mock_mut(conn_a())
            .fail_next_notify = Some(lwm2m_coap::CoapError::MessageTooBig.into());
        engine.fire_due(now);

        assert!(engine.transports_mut().comm_errors.is_empty());
        assert!(engine.observation_status(42, 69, 4).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_send_error_reports_connection_failure() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        model.set_value(resource(), Value::Str("x".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine
            .transports_mut()
            .mock_mut(conn_a())
            .fail_next_notify = Some(lwm2m_coap::CoapError::Timeout.into());
        engine.fire_due(now);

        assert_eq!(engine.transports_mut().comm_errors, vec![conn_a()]);
        // The observation itself stays registered; reconnect policy is the
        // host's business.
        assert!(engine.observation_status(42, 69, 4).is_observed);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn queue_mode_brings_connection_online() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        {
            let state = engine.transports_mut().state_mut(conn_a());
            state.socket_online = false;
            state.queue_mode = true;
        }
        model.set_value(resource(), Value::Str("wake up".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);

        assert_eq!(engine.transports_mut().brought_online, vec![conn_a()]);
        // The host reports readiness, which flushes the stored value.
        engine.schedule_flush(conn_a(), now);
        engine.fire_due(now);
        assert_eq!(engine.transports_mut().mock(conn_a()).notifications.len(), 1);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn epmin_holds_off_re_reads() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        model.set_resource_attrs(
            resource(),
            SSID_A,
            Attributes {
                epmin: Some(60),
                ..Attributes::default()
            },
        );
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        // The stored value changed, but the snapshot is younger than epmin:
        // the trigger reuses it and nothing goes out.
        model.set_value(resource(), Value::Str("too fresh".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);
        assert!(engine.transports_mut().mock(conn_a()).notifications.is_empty());

        // Once epmin elapsed, the re-read happens and the change notifies.
        let later = now + Duration::from_secs(61);
        engine.notify_changed(&resource(), SSID_A, false, later);
        engine.fire_due(later);
        assert_eq!(engine.transports_mut().mock(conn_a()).notifications.len(), 1);
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn composite_observation_spans_multiple_paths() {
        let (model, mut engine) = setup();
        let other = Path::resource(42, 70, 4);
        model.add_single_resource(other, Value::Int(7));
        let now = Instant::now();

        let request = ObserveRequest {
            token: token(1),
            action: ObserveAction::CompositeRead,
            paths: vec![resource(), other],
            accept: None,
        };
        let response = engine.handle_observe(conn_a(), request, now);
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.format, Some(ContentFormat::SenmlJson));
        let parsed: serde_json::Value =
            serde_json::from_slice(&response.payload).expect("valid json");
        assert_eq!(
            parsed,
            serde_json::json!([
                {"n": "/42/69/4", "vs": "514"},
                {"n": "/42/70/4", "v": 7}
            ])
        );

        // A change on either path triggers; both paths are re-read.
        model.set_value(other, Value::Int(8));
        engine.notify_changed(&other, SSID_A, false, now);
        engine.fire_due(now);
        let mock = engine.transports_mut().mock(conn_a());
        assert_eq!(mock.notifications.len(), 1);
        let notified: serde_json::Value =
            serde_json::from_slice(&mock.notifications[0].payload).expect("valid json");
        assert_eq!(
            notified,
            serde_json::json!([
                {"n": "/42/69/4", "vs": "514"},
                {"n": "/42/70/4", "v": 8}
            ])
        );
        engine.assert_consistent();
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_inflight_exchange() {
        let (model, mut engine) = setup();
        let now = Instant::now();
        let _ = engine.handle_observe(conn_a(), observe_request(1), now);

        model.set_value(resource(), Value::Str("x".into()));
        engine.notify_changed(&resource(), SSID_A, false, now);
        engine.fire_due(now);
        assert!(engine.transports_mut().mock(conn_a()).pending.is_some());

        engine.interrupt(conn_a());
        assert!(engine.transports_mut().mock(conn_a()).pending.is_none());
        // The queued value is still stored for after reconnection.
        assert!(engine.has_unsent_notifications(Some(SSID_A)));
        engine.assert_consistent();
    }
}
