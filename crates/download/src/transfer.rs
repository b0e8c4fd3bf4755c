// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-transfer state.

use crate::config::{DownloadFinishedHandler, NextBlockHandler};
use crate::socket::TransferSocket;
use lwm2m_coap::{ClientExchange, CoapUrl, Etag, ExchangeId, UdpTxParams};
use lwm2m_sched::JobHandle;

/// Everything one block-wise transfer owns.
pub(crate) struct Transfer {
    pub url: CoapUrl,
    pub socket: Box<dyn TransferSocket>,
    pub coap: Box<dyn ClientExchange>,
    /// User-visible progress: every byte up to here has been delivered.
    pub bytes_downloaded: usize,
    /// Negotiated BLOCK2 size; starts from the buffer-derived maximum and
    /// only ever shrinks.
    pub block_size: usize,
    /// Version tag adopted from the first response (or preset for resumed
    /// transfers).
    pub etag: Option<Etag>,
    pub exchange: Option<ExchangeId>,
    pub tx_params: UdpTxParams,
    pub job_start: Option<JobHandle>,
    pub on_next_block: NextBlockHandler,
    /// Taken exactly once, when the transfer reaches a terminal status.
    pub on_finished: Option<DownloadFinishedHandler>,
    /// Guards against re-entrant finalization: cancelling an exchange can
    /// call the response handler from within the cancel.
    pub aborting: bool,
    /// While set, exchange cancellation is part of a suspend/reconnect cycle
    /// and must not finalize the transfer.
    pub reconnecting: bool,
}

impl Transfer {
    /// Records a server-imposed smaller block size. `served` is the span of
    /// the block that produced the current chunk.
    pub fn observe_block_size(&mut self, served: usize) {
        if served < self.block_size
            && served.is_power_of_two()
            && served >= lwm2m_coap::options::MIN_BLOCK_SIZE
        {
            self.block_size = served;
        }
    }
}
