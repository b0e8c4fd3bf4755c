// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! The async shell around the engine.
//!
//! The engine itself is a plain synchronous state machine; this module owns
//! the event loop that feeds it: inbound commands are prioritized over timer
//! expirations, and due jobs are drained after every step. One loop per
//! runtime; there is no preemption inside a job.

use crate::connection::ConnRef;
use crate::engine::{InitialResponse, ObserveEngine, ObserveRequest, Transports};
use lwm2m_coap::TransportError;
use lwm2m_core::{Path, Ssid, Token};
use lwm2m_dm::DataModel;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// Commands routed into the engine's event loop.
#[derive(Debug)]
pub enum ObserveCommand {
    /// An inbound Observe request; the initial response is sent back through
    /// `reply`.
    Observe {
        /// The connection the request arrived on.
        conn: ConnRef,
        /// The decoded request.
        request: ObserveRequest,
        /// Channel for the synchronous response.
        reply: oneshot::Sender<InitialResponse>,
    },
    /// Peer-initiated cancellation of an observation.
    Cancel {
        /// The connection the cancellation arrived on.
        conn: ConnRef,
        /// Token of the observation to drop.
        token: Token,
    },
    /// A data-model value changed.
    NotifyChanged {
        /// The changed path.
        path: Path,
        /// Server filter.
        ssid: Ssid,
        /// Invert the server filter.
        invert_match: bool,
    },
    /// The exchange layer finished delivering a notification.
    Delivery {
        /// The connection it was sent on.
        conn: ConnRef,
        /// Delivery outcome.
        result: Result<(), TransportError>,
    },
    /// A connection became ready for outgoing messages.
    ConnectionUp {
        /// The connection.
        conn: ConnRef,
    },
    /// A connection's transport is being torn down.
    Interrupt {
        /// The connection.
        conn: ConnRef,
    },
    /// The server registry changed; drop state of vanished servers.
    Gc,
    /// Stop the loop.
    Shutdown,
}

/// Cloneable handle for submitting commands to a running engine loop.
#[derive(Clone)]
pub struct ObserveHandle {
    tx: mpsc::Sender<ObserveCommand>,
}

/// Creates the command channel for [`ObserveEngine::run`].
#[must_use]
pub fn observe_channel(capacity: usize) -> (ObserveHandle, mpsc::Receiver<ObserveCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ObserveHandle { tx }, rx)
}

impl ObserveHandle {
    /// Submits an Observe request and waits for the initial response.
    /// `None` means the engine loop is gone.
    pub async fn observe(
        &self,
        conn: ConnRef,
        request: ObserveRequest,
    ) -> Option<InitialResponse> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ObserveCommand::Observe {
                conn,
                request,
                reply,
            })
            .await
            .ok()?;
        response.await.ok()
    }

    /// Submits any other command.
    pub async fn send(&self, command: ObserveCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }
}

impl<M: DataModel, T: Transports> ObserveEngine<M, T> {
    /// Runs the engine event loop until [`ObserveCommand::Shutdown`] or until
    /// every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ObserveCommand>) {
        loop {
            let next_expiry = self.next_expiry();
            tokio::select! {
                biased;

                command = commands.recv() => {
                    match command {
                        None | Some(ObserveCommand::Shutdown) => {
                            debug!("observe engine loop stopping");
                            break;
                        }
                        Some(command) => self.dispatch(command),
                    }
                }

                () = async {
                    match next_expiry {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => futures::future::pending().await,
                    }
                }, if next_expiry.is_some() => {}
            }
            self.fire_due(Instant::now());
        }
    }

    fn dispatch(&mut self, command: ObserveCommand) {
        let now = Instant::now();
        match command {
            ObserveCommand::Observe {
                conn,
                request,
                reply,
            } => {
                let response = self.handle_observe(conn, request, now);
                let _ = reply.send(response);
            }
            ObserveCommand::Cancel { conn, token } => self.handle_cancel(conn, token),
            ObserveCommand::NotifyChanged {
                path,
                ssid,
                invert_match,
            } => self.notify_changed(&path, ssid, invert_match, now),
            ObserveCommand::Delivery { conn, result } => self.handle_delivery(conn, result, now),
            ObserveCommand::ConnectionUp { conn } => self.schedule_flush(conn, now),
            ObserveCommand::Interrupt { conn } => self.interrupt(conn),
            ObserveCommand::Gc => self.gc(),
            ObserveCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }
}
