// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Download configuration, user handlers and the terminal status taxonomy.

use lwm2m_coap::{Code, Etag, SocketError, TransportError, UrlError};
use lwm2m_coap::tx::TxParamsError;
use lwm2m_coap::UdpTxParams;
use serde::{Deserialize, Serialize};

/// Errors surfaced by the downloader, both synchronously from
/// [`start`](crate::Downloader::start) and inside
/// [`DownloadStatus::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The download URL could not be parsed or uses an unsupported scheme.
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    /// The per-transfer transmission parameters are invalid.
    #[error(transparent)]
    TxParams(#[from] TxParamsError),

    /// The transfer socket would share its local port with an LwM2M server
    /// socket, which must never happen (response/request traffic would be
    /// indistinguishable between the two).
    #[error("local port {port} is reserved for LwM2M server traffic")]
    LocalPortCollision {
        /// The colliding port.
        port: u16,
    },

    /// Transport-level failure (socket or CoAP).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The user's block handler rejected a chunk.
    #[error("block handler failed: {reason}")]
    Handler {
        /// Handler-provided reason.
        reason: String,
    },

    /// The transfer id does not exist (never started or already finished).
    #[error("unknown transfer {id}")]
    UnknownTransfer {
        /// The unknown id.
        id: crate::DownloadId,
    },
}

impl From<SocketError> for DownloadError {
    fn from(err: SocketError) -> DownloadError {
        DownloadError::Transport(err.into())
    }
}

impl From<lwm2m_coap::CoapError> for DownloadError {
    fn from(err: lwm2m_coap::CoapError) -> DownloadError {
        DownloadError::Transport(err.into())
    }
}

/// Terminal status of a transfer, reported exactly once through
/// [`DownloadConfig::on_download_finished`].
#[derive(Debug)]
pub enum DownloadStatus {
    /// All blocks were delivered and the server signalled the end.
    Success,
    /// The transfer was cancelled locally.
    Aborted,
    /// The remote resource changed between blocks (ETag mismatch).
    Expired,
    /// The server answered with something other than 2.05 Content.
    InvalidResponse(Code),
    /// Transport, protocol or handler failure.
    Failed(DownloadError),
}

/// Per-chunk delivery handler. Chunks arrive in order, starting at the
/// configured `start_offset`; returning an error aborts the transfer with
/// [`DownloadStatus::Failed`].
pub type NextBlockHandler = Box<dyn FnMut(&[u8], Option<&Etag>) -> Result<(), DownloadError>>;

/// Terminal-status handler; called exactly once per transfer.
pub type DownloadFinishedHandler = Box<dyn FnOnce(DownloadStatus)>;

/// Configuration of one download. Both handlers are required by
/// construction.
pub struct DownloadConfig {
    /// The `coap(s)[+tcp]://` URL to fetch.
    pub url: String,
    /// Byte offset to resume from; the first delivered chunk starts here.
    pub start_offset: usize,
    /// ETag recorded by a previous attempt; responses are validated against
    /// it from the first block.
    pub etag: Option<Etag>,
    /// Per-transfer CoAP/UDP transmission parameters; the downloader-wide
    /// defaults apply when unset.
    pub tx_params: Option<UdpTxParams>,
    /// Per-chunk delivery handler.
    pub on_next_block: NextBlockHandler,
    /// Terminal-status handler.
    pub on_download_finished: DownloadFinishedHandler,
}

/// Downloader-wide settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DownloaderConfig {
    /// Capacity of the shared inbound datagram buffer; bounds the negotiated
    /// BLOCK2 size.
    pub in_buffer_size: usize,
    /// Default transmission parameters for new transfers.
    pub tx_params: UdpTxParams,
    /// Local ports used by LwM2M server sockets; transfer sockets must not
    /// collide with them.
    pub reserved_local_ports: Vec<u16>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        DownloaderConfig {
            in_buffer_size: 1152,
            tx_params: UdpTxParams::default(),
            reserved_local_ports: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downloader_config_parses() {
        let config: DownloaderConfig = serde_json::from_str(
            r#"{"in_buffer_size": 512, "reserved_local_ports": [5683]}"#,
        )
        .expect("valid config");
        assert_eq!(config.in_buffer_size, 512);
        assert_eq!(config.reserved_local_ports, vec![5683]);
        assert_eq!(config.tx_params, UdpTxParams::default());
    }
}
