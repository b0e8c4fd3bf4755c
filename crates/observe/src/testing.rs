// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for the engine's transport collaborator.

use crate::connection::ConnRef;
use crate::engine::Transports;
use lwm2m_coap::testing::MockServerExchange;
use lwm2m_coap::{ServerExchange, TransportError};
use std::collections::BTreeMap;

/// Per-connection transport state as seen by the engine.
#[derive(Debug, Clone, Copy)]
pub struct ConnState {
    /// `ready_for_outgoing`
    pub ready: bool,
    /// `transport_online`
    pub transport_online: bool,
    /// `socket_online`
    pub socket_online: bool,
    /// `queue_mode`
    pub queue_mode: bool,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState {
            ready: true,
            transport_online: true,
            socket_online: true,
            queue_mode: false,
        }
    }
}

/// A scripted [`Transports`] implementation backed by
/// [`MockServerExchange`]s.
#[derive(Default)]
pub struct TestTransports {
    /// One mock exchange per connection.
    pub exchanges: BTreeMap<ConnRef, MockServerExchange>,
    /// Per-connection flags; connections default to fully online.
    pub states: BTreeMap<ConnRef, ConnState>,
    /// Connections the engine asked to bring online, in order.
    pub brought_online: Vec<ConnRef>,
    /// Connections reported as failed, in order.
    pub comm_errors: Vec<ConnRef>,
}

impl TestTransports {
    /// Creates an empty set; exchanges are added per connection.
    #[must_use]
    pub fn new() -> TestTransports {
        TestTransports::default()
    }

    /// Registers a connection with a fresh mock exchange, fully online.
    pub fn add_connection(&mut self, conn: ConnRef) {
        let _ = self.exchanges.insert(conn, MockServerExchange::new());
        let _ = self.states.insert(conn, ConnState::default());
    }

    /// Mutable access to a connection's flags.
    pub fn state_mut(&mut self, conn: ConnRef) -> &mut ConnState {
        self.states.entry(conn).or_default()
    }

    /// The mock exchange of a connection.
    #[must_use]
    pub fn mock(&self, conn: ConnRef) -> &MockServerExchange {
        &self.exchanges[&conn]
    }

    /// Mutable access to the mock exchange of a connection.
    pub fn mock_mut(&mut self, conn: ConnRef) -> &mut MockServerExchange {
        self.exchanges.get_mut(&conn).expect("unknown connection")
    }

    fn state(&self, conn: ConnRef) -> ConnState {
        self.states.get(&conn).copied().unwrap_or_default()
    }
}

impl Transports for TestTransports {
    fn exchange(&mut self, conn: ConnRef) -> Option<&mut dyn ServerExchange> {
        self.exchanges
            .get_mut(&conn)
            .map(|exchange| exchange as &mut dyn ServerExchange)
    }

    fn ready_for_outgoing(&self, conn: ConnRef) -> bool {
        self.state(conn).ready
    }

    fn transport_online(&self, conn: ConnRef) -> bool {
        self.state(conn).transport_online
    }

    fn socket_online(&self, conn: ConnRef) -> bool {
        self.state(conn).socket_online
    }

    fn queue_mode(&self, conn: ConnRef) -> bool {
        self.state(conn).queue_mode
    }

    fn bring_online(&mut self, conn: ConnRef) {
        self.brought_online.push(conn);
        if let Some(state) = self.states.get_mut(&conn) {
            state.socket_online = true;
        }
    }

    fn on_communication_error(&mut self, conn: ConnRef, _error: &TransportError) {
        self.comm_errors.push(conn);
    }
}
