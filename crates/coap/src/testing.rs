// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Scripted in-memory implementations of the exchange traits.
//!
//! These mocks stand in for a real CoAP stack in the observe and download
//! test suites: the server mock records notifications (pulling streamed
//! payloads chunk by chunk, exactly like a block-wise responder would), the
//! client mock serves a configured resource body block by block, honouring
//! the requested next-response offset the way the real layer does for
//! resumed transfers.

use crate::code::Code;
use crate::error::{CoapError, TransportError};
use crate::exchange::{
    ClientEvent, ClientExchange, ClientResponse, ExchangeId, ObserveId, PayloadSource,
    ReliabilityHint, RequestHeader, ResponseHeader, ResponseKind, ServerExchange,
};
use crate::options::Etag;
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// One notification captured by [`MockServerExchange`].
#[derive(Debug)]
pub struct NotifyRecord {
    /// Which observation it belongs to.
    pub observe_id: ObserveId,
    /// Response code.
    pub code: Code,
    /// Requested reliability.
    pub reliability: ReliabilityHint,
    /// Fully-pulled payload bytes (empty for error notifications).
    pub payload: Vec<u8>,
    /// The exchange started for it.
    pub exchange: ExchangeId,
}

/// A scripted server-side exchange layer.
pub struct MockServerExchange {
    /// Observations installed via `observe_start`, in order.
    pub started: Vec<ObserveId>,
    /// Observations cancelled via `observe_cancel`, in order.
    pub canceled: Vec<ObserveId>,
    /// Every notification started so far, in order.
    pub notifications: Vec<NotifyRecord>,
    /// The exchange currently in flight, if any.
    pub pending: Option<ExchangeId>,
    /// When set, the next `observe_start` fails.
    pub fail_observe_start: bool,
    /// When set, the next `notify` fails with this error.
    pub fail_next_notify: Option<TransportError>,
    /// Chunk size used when pulling streamed payloads.
    pub pull_chunk_size: usize,
    /// Reported MAX_TRANSMIT_WAIT.
    pub max_transmit_wait: Duration,
    next_exchange: u64,
}

impl Default for MockServerExchange {
    fn default() -> Self {
        MockServerExchange::new()
    }
}

impl MockServerExchange {
    /// Creates a mock with RFC 7252 default timing and 128-byte pull chunks.
    #[must_use]
    pub fn new() -> MockServerExchange {
        MockServerExchange {
            started: Vec::new(),
            canceled: Vec::new(),
            notifications: Vec::new(),
            pending: None,
            fail_observe_start: false,
            fail_next_notify: None,
            pull_chunk_size: 128,
            max_transmit_wait: crate::tx::UdpTxParams::default().max_transmit_wait(),
            next_exchange: 1,
        }
    }

    /// The payload of the most recent notification, as UTF-8.
    #[must_use]
    pub fn last_payload_str(&self) -> Option<&str> {
        self.notifications
            .last()
            .and_then(|record| std::str::from_utf8(&record.payload).ok())
    }
}

impl ServerExchange for MockServerExchange {
    fn observe_start(&mut self, id: ObserveId) -> Result<(), CoapError> {
        if self.fail_observe_start {
            self.fail_observe_start = false;
            return Err(CoapError::Protocol {
                detail: "scripted observe_start failure".to_owned(),
            });
        }
        self.started.push(id);
        Ok(())
    }

    fn observe_cancel(&mut self, id: ObserveId) {
        self.canceled.push(id);
    }

    fn notify(
        &mut self,
        id: ObserveId,
        response: &ResponseHeader,
        reliability: ReliabilityHint,
        payload: Option<Box<dyn PayloadSource>>,
    ) -> Result<ExchangeId, TransportError> {
        if let Some(err) = self.fail_next_notify.take() {
            return Err(err);
        }
        let mut bytes = Vec::new();
        if let Some(mut source) = payload {
            let mut buf = vec![0u8; self.pull_chunk_size];
            loop {
                let produced = source.pull(bytes.len(), &mut buf).map_err(|err| {
                    TransportError::Coap(CoapError::PayloadWriter {
                        reason: err.to_string(),
                    })
                })?;
                bytes.extend_from_slice(&buf[..produced]);
                if produced < buf.len() {
                    break;
                }
            }
        }
        let exchange = ExchangeId::new(self.next_exchange);
        self.next_exchange += 1;
        self.pending = Some(exchange);
        self.notifications.push(NotifyRecord {
            observe_id: id,
            code: response.code,
            reliability,
            payload: bytes,
            exchange,
        });
        Ok(exchange)
    }

    fn cancel(&mut self, exchange: ExchangeId) -> bool {
        if self.pending == Some(exchange) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    fn max_transmit_wait(&self) -> Duration {
        self.max_transmit_wait
    }
}

/// A scripted client-side exchange layer serving one resource body.
///
/// Every call to [`handle_incoming_packet`](ClientExchange::handle_incoming_packet)
/// simulates the arrival of one response datagram: the block that covers the
/// current next-response offset is sliced out of `body` and delivered with
/// the leading `offset % block_size` bytes elided, exactly as the real layer
/// does when a transfer is resumed mid-block.
pub struct MockClientExchange {
    /// The full resource body served block by block.
    pub body: Bytes,
    /// Negotiated block size.
    pub block_size: usize,
    /// ETag attached to every block, unless overridden per block.
    pub etag: Option<Etag>,
    /// Per-block-index ETag overrides (index into blocks of `body`).
    pub block_etags: Vec<Option<Etag>>,
    /// Response code; anything but 2.05 produces a final response with that
    /// code and no payload.
    pub response_code: Code,
    /// When set, the next incoming packet fails the exchange with this error.
    pub fail_next: Option<TransportError>,
    /// Requests sent so far.
    pub requests: Vec<RequestHeader>,
    queued: VecDeque<ClientEvent>,
    pending: Option<ExchangeId>,
    next_offset: usize,
    next_exchange: u64,
}

impl MockClientExchange {
    /// Creates a mock serving `body` in blocks of `block_size`.
    #[must_use]
    pub fn new(body: impl Into<Bytes>, block_size: usize) -> MockClientExchange {
        MockClientExchange {
            body: body.into(),
            block_size,
            etag: None,
            block_etags: Vec::new(),
            response_code: Code::CONTENT,
            fail_next: None,
            requests: Vec::new(),
            queued: VecDeque::new(),
            pending: None,
            next_offset: 0,
            next_exchange: 1,
        }
    }

    fn etag_for_block(&self, index: usize) -> Option<Etag> {
        self.block_etags.get(index).copied().flatten().or(self.etag)
    }

    fn next_block_event(&mut self, exchange: ExchangeId) -> ClientEvent {
        if self.response_code != Code::CONTENT {
            self.pending = None;
            return ClientEvent {
                exchange,
                kind: ResponseKind::Final(ClientResponse {
                    code: self.response_code,
                    etag: None,
                    payload_offset: self.next_offset,
                    payload: Bytes::new(),
                }),
            };
        }

        let block_index = self.next_offset / self.block_size;
        let block_end = ((block_index + 1) * self.block_size).min(self.body.len());
        let payload = self.body.slice(self.next_offset..block_end);
        let response = ClientResponse {
            code: Code::CONTENT,
            etag: self.etag_for_block(block_index),
            payload_offset: self.next_offset,
            payload,
        };
        let finished = block_end >= self.body.len();
        self.next_offset = block_end;
        if finished {
            self.pending = None;
            ClientEvent {
                exchange,
                kind: ResponseKind::Final(response),
            }
        } else {
            ClientEvent {
                exchange,
                kind: ResponseKind::Partial(response),
            }
        }
    }
}

impl ClientExchange for MockClientExchange {
    fn send_request(&mut self, request: RequestHeader) -> Result<ExchangeId, TransportError> {
        let exchange = ExchangeId::new(self.next_exchange);
        self.next_exchange += 1;
        self.requests.push(request);
        self.pending = Some(exchange);
        self.next_offset = 0;
        Ok(exchange)
    }

    fn set_next_response_payload_offset(
        &mut self,
        exchange: ExchangeId,
        offset: usize,
    ) -> Result<(), CoapError> {
        if self.pending != Some(exchange) {
            return Err(CoapError::ExchangeCanceled);
        }
        self.next_offset = offset;
        Ok(())
    }

    fn cancel(&mut self, exchange: ExchangeId) -> bool {
        if self.pending == Some(exchange) {
            self.pending = None;
            self.queued.push_back(ClientEvent {
                exchange,
                kind: ResponseKind::Canceled,
            });
            true
        } else {
            false
        }
    }

    fn has_pending_exchange(&self) -> bool {
        self.pending.is_some()
    }

    fn handle_incoming_packet(&mut self) -> Vec<ClientEvent> {
        if let Some(event) = self.queued.pop_front() {
            return vec![event];
        }
        let Some(exchange) = self.pending else {
            return Vec::new();
        };
        if let Some(err) = self.fail_next.take() {
            self.pending = None;
            return vec![ClientEvent {
                exchange,
                kind: ResponseKind::Fail(err),
            }];
        }
        vec![self.next_block_event(exchange)]
    }
}

/// A cloneable handle to a [`MockClientExchange`], usable wherever a boxed
/// [`ClientExchange`] is required while the test keeps a handle for
/// inspection and scripting.
#[derive(Clone)]
pub struct SharedMockClient {
    inner: Rc<RefCell<MockClientExchange>>,
}

impl SharedMockClient {
    /// Wraps a mock for shared use.
    #[must_use]
    pub fn new(mock: MockClientExchange) -> SharedMockClient {
        SharedMockClient {
            inner: Rc::new(RefCell::new(mock)),
        }
    }

    /// Borrows the underlying mock.
    pub fn with<R>(&self, f: impl FnOnce(&mut MockClientExchange) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

impl ClientExchange for SharedMockClient {
    fn send_request(&mut self, request: RequestHeader) -> Result<ExchangeId, TransportError> {
        self.inner.borrow_mut().send_request(request)
    }

    fn set_next_response_payload_offset(
        &mut self,
        exchange: ExchangeId,
        offset: usize,
    ) -> Result<(), CoapError> {
        self.inner
            .borrow_mut()
            .set_next_response_payload_offset(exchange, offset)
    }

    fn cancel(&mut self, exchange: ExchangeId) -> bool {
        self.inner.borrow_mut().cancel(exchange)
    }

    fn has_pending_exchange(&self) -> bool {
        self.inner.borrow().has_pending_exchange()
    }

    fn handle_incoming_packet(&mut self) -> Vec<ClientEvent> {
        self.inner.borrow_mut().handle_incoming_packet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn get_request() -> RequestHeader {
        RequestHeader {
            code: Code::GET,
            options: Options::new(),
        }
    }

    #[test]
    fn client_mock_serves_blocks_in_order() {
        let mut mock = MockClientExchange::new(&b"0123456789abcdef0123"[..], 16);
        let exchange = mock.send_request(get_request()).expect("sent");

        let first = mock.handle_incoming_packet();
        assert_eq!(first.len(), 1);
        match &first[0].kind {
            ResponseKind::Partial(response) => {
                assert_eq!(response.payload_offset, 0);
                assert_eq!(&response.payload[..], b"0123456789abcdef");
            }
            other => panic!("expected partial, got {other:?}"),
        }

        let second = mock.handle_incoming_packet();
        match &second[0].kind {
            ResponseKind::Final(response) => {
                assert_eq!(response.payload_offset, 16);
                assert_eq!(&response.payload[..], b"0123");
            }
            other => panic!("expected final, got {other:?}"),
        }
        assert_eq!(first[0].exchange, exchange);
        assert!(!mock.has_pending_exchange());
    }

    #[test]
    fn client_mock_elides_leading_bytes_on_resumption() {
        let mut mock = MockClientExchange::new(&b"0123456789abcdef0123"[..], 16);
        let exchange = mock.send_request(get_request()).expect("sent");
        mock.set_next_response_payload_offset(exchange, 5)
            .expect("offset accepted");

        let events = mock.handle_incoming_packet();
        match &events[0].kind {
            ResponseKind::Partial(response) => {
                assert_eq!(response.payload_offset, 5);
                assert_eq!(&response.payload[..], b"56789abcdef");
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn server_mock_pulls_streamed_payloads() {
        struct Fixed(&'static [u8]);
        impl PayloadSource for Fixed {
            fn pull(
                &mut self,
                offset: usize,
                buf: &mut [u8],
            ) -> Result<usize, crate::exchange::PayloadError> {
                let remaining = &self.0[offset..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                Ok(n)
            }
        }

        let mut mock = MockServerExchange::new();
        mock.pull_chunk_size = 4;
        let token = lwm2m_core::Token::new(&[1]).expect("valid");
        let _ = mock
            .notify(
                ObserveId { token },
                &ResponseHeader {
                    code: Code::CONTENT,
                    format: None,
                },
                ReliabilityHint::PreferNonConfirmable,
                Some(Box::new(Fixed(b"Hello, notify"))),
            )
            .expect("notify started");
        assert_eq!(mock.last_payload_str(), Some("Hello, notify"));
        assert!(mock.pending.is_some());
    }
}
