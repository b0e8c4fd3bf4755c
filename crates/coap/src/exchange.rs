// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Exchange identities and the two asynchronous-exchange traits the runtime
//! consumes: server-side notify machinery and client-side requests.

use crate::code::Code;
use crate::error::{CoapError, TransportError};
use crate::options::{ContentFormat, Etag, Options};
use bytes::Bytes;
use lwm2m_core::Token;
use std::time::Duration;

/// Identifier of one asynchronous exchange within a CoAP context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Wraps a context-allocated identifier.
    #[must_use]
    pub const fn new(value: u64) -> ExchangeId {
        ExchangeId(value)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Token-based identity of an observation, as registered with the exchange
/// layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObserveId {
    /// The observation token.
    pub token: Token,
}

/// Reliability requested for one notification. The exchange layer may still
/// upgrade NON to CON for its own reasons (e.g. Observe sequence rollover).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReliabilityHint {
    /// Send as a Confirmable message.
    PreferConfirmable,
    /// Send as a Non-confirmable message.
    PreferNonConfirmable,
}

/// The response header of a notification: code plus Content-Format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Response code (`2.05` for values, `4.xx`/`5.xx` for error values).
    pub code: Code,
    /// Content-Format option; absent for error responses.
    pub format: Option<ContentFormat>,
}

/// A client request header: code plus emitted options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    /// Request code; the downloader only ever sends GET.
    pub code: Code,
    /// Uri-Path / Uri-Query options, in order.
    pub options: Options,
}

/// Errors a [`PayloadSource`] may report while producing a chunk.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    /// The requested offset does not continue the stream. Streaming
    /// serialization cannot rewind, so this is unrecoverable.
    #[error("payload requested at offset {requested}, cursor is at {expected}")]
    OffsetMismatch {
        /// Where the cursor stands.
        expected: usize,
        /// What the exchange layer asked for.
        requested: usize,
    },
    /// Serializing the next entry failed.
    #[error("serialization failed: {reason}")]
    Serialize {
        /// Human-readable reason.
        reason: String,
    },
}

/// Pull-mode payload producer handed to the exchange layer.
///
/// The exchange layer calls [`pull`](PayloadSource::pull) repeatedly, once per
/// outgoing block, with the byte offset it needs next. Producing fewer bytes
/// than the buffer holds signals the end of the payload.
pub trait PayloadSource {
    /// Fills `buf` with payload bytes starting at `offset`.
    fn pull(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, PayloadError>;
}

/// Server-side exchange machinery bound to one connection: observation
/// registration and asynchronous notify delivery.
///
/// Delivery completion is reported out-of-band (the embedding runtime routes
/// it back into the observe engine), so `notify` only starts the exchange.
pub trait ServerExchange {
    /// Registers an observation so the context will accept notifications for
    /// its token and report peer cancellation.
    fn observe_start(&mut self, id: ObserveId) -> Result<(), CoapError>;

    /// Deregisters an observation.
    fn observe_cancel(&mut self, id: ObserveId);

    /// Starts an asynchronous notification exchange. `payload` is `None` for
    /// error notifications.
    fn notify(
        &mut self,
        id: ObserveId,
        response: &ResponseHeader,
        reliability: ReliabilityHint,
        payload: Option<Box<dyn PayloadSource>>,
    ) -> Result<ExchangeId, TransportError>;

    /// Cancels an in-flight exchange. Returns `false` if it was already
    /// finished.
    fn cancel(&mut self, exchange: ExchangeId) -> bool;

    /// MAX_TRANSMIT_WAIT for this connection's transport; drives the
    /// once-a-day confirmable promotion.
    fn max_transmit_wait(&self) -> Duration;
}

/// One (possibly partial) response delivered to a client request.
#[derive(Clone, Debug)]
pub struct ClientResponse {
    /// Response code.
    pub code: Code,
    /// ETag option, if present.
    pub etag: Option<Etag>,
    /// Byte offset of `payload` within the whole resource, after block
    /// reassembly and requested-offset elision.
    pub payload_offset: usize,
    /// The payload bytes.
    pub payload: Bytes,
}

/// How a client exchange advanced.
#[derive(Debug)]
pub enum ResponseKind {
    /// Final response; the transfer is complete.
    Final(ClientResponse),
    /// One block of a longer transfer; more will follow.
    Partial(ClientResponse),
    /// The exchange failed.
    Fail(TransportError),
    /// The exchange was cancelled locally.
    Canceled,
}

/// An event produced while driving a client context.
#[derive(Debug)]
pub struct ClientEvent {
    /// The exchange this event belongs to.
    pub exchange: ExchangeId,
    /// What happened.
    pub kind: ResponseKind,
}

/// Client-side exchange machinery bound to one socket: asynchronous requests
/// with block-wise response reassembly.
pub trait ClientExchange {
    /// Sends an asynchronous request; responses arrive as [`ClientEvent`]s
    /// from [`handle_incoming_packet`](ClientExchange::handle_incoming_packet).
    fn send_request(&mut self, request: RequestHeader) -> Result<ExchangeId, TransportError>;

    /// Tells the context at which payload offset the next response chunk
    /// should start. The context derives the BLOCK2 seq/size from it and
    /// elides the leading `offset % block_size` bytes at delivery time.
    fn set_next_response_payload_offset(
        &mut self,
        exchange: ExchangeId,
        offset: usize,
    ) -> Result<(), CoapError>;

    /// Cancels an exchange; a `Canceled` event is delivered to its handler.
    /// Returns `false` if no such exchange was pending.
    fn cancel(&mut self, exchange: ExchangeId) -> bool;

    /// True iff some exchange is still awaiting responses.
    fn has_pending_exchange(&self) -> bool;

    /// Processes one incoming datagram worth of work and returns the exchange
    /// events it produced.
    fn handle_incoming_packet(&mut self) -> Vec<ClientEvent>;
}
