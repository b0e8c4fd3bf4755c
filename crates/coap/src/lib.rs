// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! The CoAP exchange-layer contract consumed by the client runtime.
//!
//! This crate does not implement the CoAP message codec. It defines the
//! surface the runtime programs against: message codes and options, exchange
//! identities, the asynchronous notify and client-request traits, the error
//! taxonomy (with recovery hints) that drives the send-path fatal-vs-
//! recoverable split, transmission parameters, and `coap(s)://` URL parsing.
//!
//! The [`testing`] module provides scripted in-memory implementations of both
//! exchange traits, used by the observe and download test suites.

pub mod code;
pub mod error;
pub mod exchange;
pub mod options;
pub mod testing;
pub mod tx;
pub mod url;

pub use code::Code;
pub use error::{CoapError, RecoveryAction, SocketError, TransportError};
pub use exchange::{
    ClientEvent, ClientExchange, ClientResponse, ExchangeId, ObserveId, PayloadError,
    PayloadSource, ReliabilityHint, RequestHeader, ResponseHeader, ResponseKind, ServerExchange,
};
pub use options::{ContentFormat, Etag, EtagError, Options, negotiated_block_size};
pub use tx::UdpTxParams;
pub use url::{CoapUrl, TransportKind, UrlError};
