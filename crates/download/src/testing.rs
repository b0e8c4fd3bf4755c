// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for transfer sockets and exchange factories.

use crate::config::DownloadError;
use crate::socket::{SocketFactory, TransferSocket};
use crate::ExchangeFactory;
use async_trait::async_trait;
use lwm2m_coap::testing::SharedMockClient;
use lwm2m_coap::{ClientExchange, SocketError, TransportKind, UdpTxParams};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared counters of a [`MockTransferSocket`], kept by the test.
#[derive(Debug, Default)]
pub struct SocketStats {
    /// Number of `connect` calls.
    pub connects: usize,
    /// Number of `shutdown` calls.
    pub shutdowns: usize,
    /// Number of `close` calls.
    pub closes: usize,
}

/// A scripted transfer socket.
pub struct MockTransferSocket {
    /// Remote address recorded by the last `connect`.
    pub remote: Option<(String, u16)>,
    /// Reported local port.
    pub local_port: u16,
    /// What `session_resumed` reports after the next `connect`.
    pub resume_session: bool,
    /// Shared call counters.
    pub stats: Rc<RefCell<SocketStats>>,
}

#[async_trait(?Send)]
impl TransferSocket for MockTransferSocket {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), SocketError> {
        self.stats.borrow_mut().connects += 1;
        self.remote = Some((host.to_owned(), port));
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SocketError> {
        self.stats.borrow_mut().shutdowns += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SocketError> {
        self.stats.borrow_mut().closes += 1;
        Ok(())
    }

    fn remote_host(&self) -> Option<String> {
        self.remote.as_ref().map(|(host, _)| host.clone())
    }

    fn remote_port(&self) -> Option<u16> {
        self.remote.as_ref().map(|(_, port)| *port)
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.local_port)
    }

    fn session_resumed(&self) -> bool {
        self.resume_session
    }
}

/// Factory handing out [`MockTransferSocket`]s sharing one stats block.
pub struct MockSocketFactory {
    /// Local port assigned to created sockets.
    pub local_port: u16,
    /// Whether created sockets resume their security session on reconnect.
    pub resume_session: bool,
    /// Stats shared by every created socket.
    pub stats: Rc<RefCell<SocketStats>>,
}

impl Default for MockSocketFactory {
    fn default() -> Self {
        MockSocketFactory {
            local_port: 49152,
            resume_session: true,
            stats: Rc::new(RefCell::new(SocketStats::default())),
        }
    }
}

#[async_trait(?Send)]
impl SocketFactory for MockSocketFactory {
    async fn create(
        &mut self,
        _kind: TransportKind,
    ) -> Result<Box<dyn TransferSocket>, SocketError> {
        Ok(Box::new(MockTransferSocket {
            remote: None,
            local_port: self.local_port,
            resume_session: self.resume_session,
            stats: self.stats.clone(),
        }))
    }
}

/// Factory handing out pre-scripted [`SharedMockClient`]s, in order.
#[derive(Default)]
pub struct MockExchangeFactory {
    /// Clients to hand out; `create` pops from the front.
    pub clients: RefCell<VecDeque<SharedMockClient>>,
}

impl MockExchangeFactory {
    /// Queues a client for the next `create` call.
    pub fn push(&self, client: SharedMockClient) {
        self.clients.borrow_mut().push_back(client);
    }
}

impl ExchangeFactory for MockExchangeFactory {
    fn create(&mut self, _tx_params: &UdpTxParams) -> Result<Box<dyn ClientExchange>, DownloadError> {
        let client = self
            .clients
            .borrow_mut()
            .pop_front()
            .expect("no scripted client exchange left");
        Ok(Box::new(client))
    }
}
