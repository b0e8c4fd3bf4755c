// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Block-wise CoAP downloader.
//!
//! A [`Downloader`] manages a set of independent transfers. Each transfer
//! owns a dedicated socket and CoAP context and walks one state machine:
//! start a GET (resuming at any byte offset), validate ETags across blocks,
//! hand chunks to the user, and survive suspend/reconnect cycles, recreating
//! the CoAP context when the security session did not resume. Terminal
//! statuses are reported exactly once per transfer.
//!
//! The host drives it like the rest of the runtime: packets in via
//! [`Downloader::handle_incoming`], timers out via
//! [`Downloader::next_expiry`] / [`Downloader::fire_due`].

pub mod config;
pub mod socket;
pub mod testing;

mod transfer;

pub use config::{
    DownloadConfig, DownloadError, DownloadFinishedHandler, DownloadStatus, DownloaderConfig,
    NextBlockHandler,
};
pub use socket::{SocketFactory, TransferSocket, UdpSocketFactory, UdpTransferSocket};

use crate::transfer::Transfer;
use lwm2m_coap::{
    ClientEvent, ClientExchange, ClientResponse, CoapError, CoapUrl, Code, RequestHeader,
    ResponseKind, SocketError, TransportError, UdpTxParams, negotiated_block_size,
};
use lwm2m_sched::JobQueue;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Estimated per-datagram overhead in the inbound buffer: CoAP header, token
/// and options ahead of a BLOCK2 payload.
const BLOCK_HEADER_OVERHEAD: usize = 32;

/// Identifier of one transfer within a [`Downloader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadId(u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates client CoAP contexts for transfers; recreated on reconnect when
/// the security session did not resume.
pub trait ExchangeFactory {
    /// Creates a context with the given transmission parameters.
    fn create(&mut self, tx_params: &UdpTxParams) -> Result<Box<dyn ClientExchange>, DownloadError>;
}

#[derive(Clone, Copy, Debug)]
enum DownloadJob {
    Start(DownloadId),
    Cleanup(DownloadId),
}

/// The transfer registry.
pub struct Downloader<S, E> {
    config: DownloaderConfig,
    socket_factory: S,
    exchange_factory: E,
    transfers: BTreeMap<u64, Transfer>,
    sched: JobQueue<DownloadJob>,
    next_id: u64,
}

impl<S: SocketFactory, E: ExchangeFactory> Downloader<S, E> {
    /// Creates an empty downloader.
    pub fn new(config: DownloaderConfig, socket_factory: S, exchange_factory: E) -> Downloader<S, E> {
        Downloader {
            config,
            socket_factory,
            exchange_factory,
            transfers: BTreeMap::new(),
            sched: JobQueue::new(),
            next_id: 1,
        }
    }

    /// Starts a transfer: validates the URL and parameters, creates and
    /// connects the socket, installs a CoAP context and schedules the first
    /// request.
    ///
    /// Errors are returned synchronously; `on_download_finished` is only ever
    /// called for transfers this method admitted.
    pub async fn start(&mut self, cfg: DownloadConfig) -> Result<DownloadId, DownloadError> {
        let url = CoapUrl::parse(&cfg.url)?;
        let tx_params = cfg.tx_params.unwrap_or(self.config.tx_params);
        tx_params.validate()?;
        let Some(block_size) = negotiated_block_size(self.config.in_buffer_size, BLOCK_HEADER_OVERHEAD)
        else {
            return Err(CoapError::MessageTooBig.into());
        };

        let mut socket = self.socket_factory.create(url.kind).await?;
        socket.connect(&url.host, url.port).await?;
        if let Some(port) = socket.local_port() {
            // A transfer socket sharing its local port with an LwM2M server
            // socket would load-balance datagrams between the two contexts.
            if self.config.reserved_local_ports.contains(&port) {
                let _ = socket.close();
                return Err(DownloadError::LocalPortCollision { port });
            }
        }
        let coap = self.exchange_factory.create(&tx_params)?;

        let id = DownloadId(self.next_id);
        self.next_id += 1;
        let mut transfer = Transfer {
            url,
            socket,
            coap,
            bytes_downloaded: cfg.start_offset,
            block_size,
            etag: cfg.etag,
            exchange: None,
            tx_params,
            job_start: None,
            on_next_block: cfg.on_next_block,
            on_finished: Some(cfg.on_download_finished),
            aborting: false,
            reconnecting: false,
        };
        transfer.job_start = Some(
            self.sched
                .schedule_at(Instant::now(), DownloadJob::Start(id)),
        );
        let _ = self.transfers.insert(id.0, transfer);
        info!(%id, offset = cfg.start_offset, "download started");
        Ok(id)
    }

    /// Aborts a transfer; `on_download_finished(Aborted)` fires unless the
    /// transfer already finished. Idempotent.
    pub fn abort(&mut self, id: DownloadId) {
        self.finish(id, DownloadStatus::Aborted);
    }

    /// IDs of all live transfers, for the host's socket poll loop.
    #[must_use]
    pub fn transfer_ids(&self) -> Vec<DownloadId> {
        self.transfers.keys().map(|&id| DownloadId(id)).collect()
    }

    /// True iff the transfer still exists.
    #[must_use]
    pub fn is_active(&self, id: DownloadId) -> bool {
        self.transfers.contains_key(&id.0)
    }

    /// Drives a transfer's CoAP context after its socket became readable.
    pub fn handle_incoming(&mut self, id: DownloadId) {
        let events: Vec<ClientEvent> = match self.transfers.get_mut(&id.0) {
            Some(transfer) => transfer.coap.handle_incoming_packet(),
            None => return,
        };
        for event in events {
            self.handle_event(id, event);
        }
    }

    /// Overrides the offset the next response block should start at; also
    /// rewinds or advances the user-visible progress counter.
    pub fn set_next_block_offset(
        &mut self,
        id: DownloadId,
        offset: usize,
    ) -> Result<(), DownloadError> {
        let Some(transfer) = self.transfers.get_mut(&id.0) else {
            return Err(DownloadError::UnknownTransfer { id });
        };
        if let Some(exchange) = transfer.exchange {
            transfer
                .coap
                .set_next_response_payload_offset(exchange, offset)?;
        }
        transfer.bytes_downloaded = offset;
        Ok(())
    }

    /// Suspends a transfer: tears down the exchange and shuts the socket
    /// down for traffic without closing it, so the remote address survives
    /// for [`reconnect`](Downloader::reconnect).
    pub fn suspend(&mut self, id: DownloadId) {
        let Some(transfer) = self.transfers.get_mut(&id.0) else {
            return;
        };
        info!(%id, "suspending download");
        transfer.reconnecting = true;
        if let Some(handle) = transfer.job_start.take() {
            let _ = self.sched.cancel(handle);
        }
        if let Some(exchange) = transfer.exchange.take() {
            let _ = transfer.coap.cancel(exchange);
        }
        let _ = transfer.socket.shutdown();
    }

    /// Suspends every live transfer.
    pub fn suspend_all(&mut self) {
        for id in self.transfer_ids() {
            self.suspend(id);
        }
    }

    /// Reconnects a transfer's socket to its recorded remote. When the
    /// security session did not resume, the CoAP context is recreated; when
    /// no exchange is pending afterwards, a fresh request is scheduled.
    pub async fn reconnect(&mut self, id: DownloadId) {
        enum Next {
            Schedule,
            KeepGoing,
            Fail(DownloadError),
        }
        let next = 'reconnect: {
            let Some(transfer) = self.transfers.get_mut(&id.0) else {
                return;
            };
            transfer.reconnecting = true;
            let (host, port) = match (transfer.socket.remote_host(), transfer.socket.remote_port())
            {
                (Some(host), Some(port)) => (host, port),
                _ => break 'reconnect Next::Fail(SocketError::InvalidArgument.into()),
            };
            let _ = transfer.socket.shutdown();
            let _ = transfer.socket.close();
            if let Err(err) = transfer.socket.connect(&host, port).await {
                warn!(%id, "could not reconnect download socket");
                break 'reconnect Next::Fail(err.into());
            }
            if !transfer.socket.session_resumed() {
                // A new (D)TLS session invalidates all in-flight exchange
                // state; retransmissions may only continue on a resumed one.
                match self.exchange_factory.create(&transfer.tx_params) {
                    Ok(coap) => {
                        transfer.coap = coap;
                        transfer.exchange = None;
                    }
                    Err(err) => break 'reconnect Next::Fail(err),
                }
            }
            if transfer.exchange.is_none() {
                Next::Schedule
            } else {
                Next::KeepGoing
            }
        };
        match next {
            Next::Schedule => {
                info!(%id, "scheduling download resumption");
                let handle = self
                    .sched
                    .schedule_at(Instant::now(), DownloadJob::Start(id));
                if let Some(transfer) = self.transfers.get_mut(&id.0) {
                    transfer.job_start = Some(handle);
                }
            }
            Next::KeepGoing => {}
            Next::Fail(err) => self.finish(id, DownloadStatus::Failed(err)),
        }
    }

    /// Reconnects every live transfer.
    pub async fn reconnect_all(&mut self) {
        for id in self.transfer_ids() {
            self.reconnect(id).await;
        }
    }

    /// The next timer deadline, for embedding in an event loop.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        if self.sched.has_ready() {
            return Some(Instant::now());
        }
        self.sched.next_expiry()
    }

    /// Runs every due start and cleanup job.
    pub fn fire_due(&mut self, now: Instant) {
        while let Some(job) = self.sched.pop_due(now) {
            match job {
                DownloadJob::Start(id) => self.run_start(id),
                DownloadJob::Cleanup(id) => self.run_cleanup(id),
            }
        }
    }

    fn run_start(&mut self, id: DownloadId) {
        let Some(transfer) = self.transfers.get_mut(&id.0) else {
            debug!(%id, "download expired before its start job ran");
            return;
        };
        transfer.job_start = None;
        transfer.reconnecting = false;
        let request = RequestHeader {
            code: Code::GET,
            options: transfer.url.to_options(),
        };
        let offset = transfer.bytes_downloaded;
        let result = transfer.coap.send_request(request).and_then(|exchange| {
            transfer
                .coap
                .set_next_response_payload_offset(exchange, offset)
                .map_err(TransportError::from)?;
            Ok(exchange)
        });
        match result {
            Ok(exchange) => {
                trace!(%id, offset, "download request sent");
                transfer.exchange = Some(exchange);
            }
            Err(err) => self.finish(id, DownloadStatus::Failed(err.into())),
        }
    }

    fn run_cleanup(&mut self, id: DownloadId) {
        if let Some(mut transfer) = self.transfers.remove(&id.0) {
            trace!(%id, "disposing download context and socket");
            let _ = transfer.socket.close();
        }
    }

    fn handle_event(&mut self, id: DownloadId, event: ClientEvent) {
        let (aborting, reconnecting, current) = match self.transfers.get(&id.0) {
            Some(transfer) => (transfer.aborting, transfer.reconnecting, transfer.exchange),
            None => return,
        };
        if aborting {
            return;
        }
        match event.kind {
            ResponseKind::Partial(response) => {
                if current == Some(event.exchange) {
                    self.handle_response(id, false, response);
                }
            }
            ResponseKind::Final(response) => {
                if current == Some(event.exchange) {
                    self.handle_response(id, true, response);
                }
            }
            ResponseKind::Fail(err) => {
                if current != Some(event.exchange) {
                    return;
                }
                if let Some(transfer) = self.transfers.get_mut(&id.0) {
                    transfer.exchange = None;
                }
                debug!(%id, %err, "download failed");
                if matches!(err, TransportError::Coap(CoapError::EtagMismatch)) {
                    self.finish(id, DownloadStatus::Expired);
                } else {
                    self.finish(id, DownloadStatus::Failed(err.into()));
                }
            }
            ResponseKind::Canceled => {
                debug!(%id, "download request canceled");
                if !reconnecting {
                    self.finish(id, DownloadStatus::Aborted);
                }
            }
        }
    }

    fn handle_response(&mut self, id: DownloadId, is_final: bool, response: ClientResponse) {
        let outcome = {
            let Some(transfer) = self.transfers.get_mut(&id.0) else {
                return;
            };
            if is_final {
                transfer.exchange = None;
            }
            if response.code != Code::CONTENT {
                debug!(%id, code = %response.code, "server responded with an unexpected code");
                Some(DownloadStatus::InvalidResponse(response.code))
            } else {
                // The exchange layer validates ETags within one exchange, but
                // a transfer resumed from persisted state has history the
                // layer knows nothing about.
                let expired = match (transfer.etag, response.etag) {
                    (None, Some(etag)) => {
                        transfer.etag = Some(etag);
                        false
                    }
                    (Some(expected), Some(received)) => expected != received,
                    _ => false,
                };
                if expired {
                    debug!(%id, "remote resource expired");
                    Some(DownloadStatus::Expired)
                } else {
                    debug_assert_eq!(transfer.bytes_downloaded, response.payload_offset);
                    if !is_final {
                        transfer.observe_block_size(
                            response.payload_offset % transfer.block_size
                                + response.payload.len(),
                        );
                    }
                    match (transfer.on_next_block)(&response.payload, response.etag.as_ref()) {
                        Ok(()) => {
                            if transfer.bytes_downloaded == response.payload_offset {
                                transfer.bytes_downloaded += response.payload.len();
                            }
                            trace!(%id, downloaded = transfer.bytes_downloaded, "block delivered");
                            if is_final {
                                info!(%id, "transfer finished");
                                Some(DownloadStatus::Success)
                            } else {
                                None
                            }
                        }
                        Err(err) => Some(DownloadStatus::Failed(err)),
                    }
                }
            }
        };
        if let Some(status) = outcome {
            self.finish(id, status);
        }
    }

    /// Moves a transfer into its terminal state: fires the user callback and
    /// defers context/socket disposal to the next scheduler tick, because the
    /// response handler that got us here may still be on the stack.
    fn finish(&mut self, id: DownloadId, status: DownloadStatus) {
        let Some(transfer) = self.transfers.get_mut(&id.0) else {
            return;
        };
        if transfer.aborting {
            return;
        }
        transfer.aborting = true;
        if let Some(handle) = transfer.job_start.take() {
            let _ = self.sched.cancel(handle);
        }
        if let Some(exchange) = transfer.exchange.take() {
            let _ = transfer.coap.cancel(exchange);
        }
        if let Some(on_finished) = transfer.on_finished.take() {
            on_finished(status);
        }
        self.sched.schedule_now(DownloadJob::Cleanup(id));
    }
}
