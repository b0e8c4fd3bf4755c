// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy emitted by the exchange layer.
//!
//! Two categories exist: CoAP-level errors (with a recovery hint) and
//! socket-level errors. The observe send path and the downloader branch on
//! this split: a small set of socket errors plus every CoAP error without the
//! recreate-context hint is recoverable; everything else means the connection
//! is no longer usable.

/// What the exchange layer recommends after a CoAP-level error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecoveryAction {
    /// The exchange failed but the context is still usable.
    None,
    /// The CoAP context is in an unknown state and must be recreated
    /// (typically together with the underlying connection).
    RecreateContext,
}

/// CoAP-level exchange errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoapError {
    /// No response (or ACK for a Separate Response) within the exchange
    /// lifetime.
    #[error("exchange timed out")]
    Timeout,

    /// A message did not fit into the shared buffer.
    #[error("message too big")]
    MessageTooBig,

    /// The ETag changed between blocks of a block-wise transfer.
    #[error("ETag mismatch during block-wise transfer")]
    EtagMismatch,

    /// The peer answered a notification with a Reset message; the exchange
    /// layer has already cancelled the observation.
    #[error("peer sent Reset")]
    UdpResetReceived,

    /// The exchange was cancelled locally; any pending callback sees this.
    #[error("exchange canceled")]
    ExchangeCanceled,

    /// The payload writer refused to produce a chunk.
    #[error("payload writer failed: {reason}")]
    PayloadWriter {
        /// Writer-provided reason.
        reason: String,
    },

    /// A malformed or protocol-violating message left the context in an
    /// unknown state.
    #[error("protocol error: {detail}")]
    Protocol {
        /// Human-readable detail.
        detail: String,
    },
}

impl CoapError {
    /// The recovery hint attached to this error.
    #[must_use]
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            CoapError::Timeout | CoapError::Protocol { .. } => RecoveryAction::RecreateContext,
            CoapError::MessageTooBig
            | CoapError::EtagMismatch
            | CoapError::UdpResetReceived
            | CoapError::ExchangeCanceled
            | CoapError::PayloadWriter { .. } => RecoveryAction::None,
        }
    }
}

/// Socket-level errors, mirroring the errno values the send path treats
/// specially.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// An invalid argument was passed somewhere along the stack (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// A truncated datagram was received (`EMSGSIZE`).
    #[error("message too large for the socket buffer")]
    MessageTooLarge,

    /// Allocation failure while handling the message (`ENOMEM`).
    #[error("out of memory")]
    OutOfMemory,

    /// Any other I/O failure; the socket is assumed unusable.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// An error from either category, as surfaced by exchange callbacks.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CoAP-level error.
    #[error(transparent)]
    Coap(#[from] CoapError),

    /// Socket-level error.
    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl TransportError {
    /// True iff the connection survives this send failure: the exchange ends
    /// but registered observations stay and the socket remains usable.
    ///
    /// Recoverable: `EINVAL`/`EMSGSIZE`/`ENOMEM` plus every CoAP error whose
    /// recovery hint is not recreate-context.
    #[must_use]
    pub fn is_recoverable_send_error(&self) -> bool {
        match self {
            TransportError::Coap(err) => err.recovery_action() == RecoveryAction::None,
            TransportError::Socket(
                SocketError::InvalidArgument
                | SocketError::MessageTooLarge
                | SocketError::OutOfMemory,
            ) => true,
            TransportError::Socket(SocketError::Io(_)) => false,
        }
    }

    /// True iff the exchange layer itself already resolved this failure
    /// (peer Reset cancelling the observation, local cancellation); the
    /// caller has nothing left to do.
    #[must_use]
    pub fn handled_by_exchange_layer(&self) -> bool {
        matches!(
            self,
            TransportError::Coap(CoapError::UdpResetReceived | CoapError::ExchangeCanceled)
        )
    }
}
