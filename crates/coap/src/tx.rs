// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! CoAP/UDP transmission parameters (RFC 7252 §4.8) and the derived time
//! spans the runtime plans around.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on one-way network latency assumed by RFC 7252.
const MAX_LATENCY: Duration = Duration::from_secs(100);

/// Errors produced while validating [`UdpTxParams`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TxParamsError {
    /// `ack_timeout` must be positive.
    #[error("ack_timeout must be positive")]
    ZeroAckTimeout,
    /// `ack_random_factor` must be at least 1.0 and finite.
    #[error("ack_random_factor {0} out of range (must be >= 1.0)")]
    AckRandomFactor(f64),
    /// `nstart` must be at least 1.
    #[error("nstart must be at least 1")]
    ZeroNstart,
}

/// CoAP/UDP retransmission parameters, overridable per transfer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UdpTxParams {
    /// Initial retransmission timeout.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Randomization factor applied to `ack_timeout`.
    pub ack_random_factor: f64,
    /// Maximum number of retransmissions of a Confirmable message.
    pub max_retransmit: u32,
    /// Maximum number of simultaneous outstanding Confirmable exchanges.
    pub nstart: u32,
}

impl Default for UdpTxParams {
    fn default() -> Self {
        UdpTxParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
        }
    }
}

fn mul_f64(duration: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(duration.as_secs_f64() * factor)
}

impl UdpTxParams {
    /// Validates the parameter set.
    pub fn validate(&self) -> Result<(), TxParamsError> {
        if self.ack_timeout.is_zero() {
            return Err(TxParamsError::ZeroAckTimeout);
        }
        if !self.ack_random_factor.is_finite() || self.ack_random_factor < 1.0 {
            return Err(TxParamsError::AckRandomFactor(self.ack_random_factor));
        }
        if self.nstart == 0 {
            return Err(TxParamsError::ZeroNstart);
        }
        Ok(())
    }

    /// MAX_TRANSMIT_SPAN: time from the first transmission of a Confirmable
    /// message to its last retransmission.
    #[must_use]
    pub fn max_transmit_span(&self) -> Duration {
        let doublings = (1u64 << self.max_retransmit) - 1;
        mul_f64(self.ack_timeout * doublings as u32, self.ack_random_factor)
    }

    /// MAX_TRANSMIT_WAIT: time from the first transmission to when the sender
    /// gives up on an acknowledgement.
    #[must_use]
    pub fn max_transmit_wait(&self) -> Duration {
        let doublings = (1u64 << (self.max_retransmit + 1)) - 1;
        mul_f64(self.ack_timeout * doublings as u32, self.ack_random_factor)
    }

    /// EXCHANGE_LIFETIME: how long exchange state must be retained. Also the
    /// window within which a Separate Response must arrive.
    #[must_use]
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + MAX_LATENCY * 2 + self.ack_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc7252_defaults() {
        let params = UdpTxParams::default();
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(247));
    }

    #[test]
    fn validation() {
        assert!(UdpTxParams::default().validate().is_ok());
        assert_eq!(
            UdpTxParams {
                ack_timeout: Duration::ZERO,
                ..UdpTxParams::default()
            }
            .validate(),
            Err(TxParamsError::ZeroAckTimeout)
        );
        assert_eq!(
            UdpTxParams {
                ack_random_factor: 0.5,
                ..UdpTxParams::default()
            }
            .validate(),
            Err(TxParamsError::AckRandomFactor(0.5))
        );
        assert_eq!(
            UdpTxParams {
                nstart: 0,
                ..UdpTxParams::default()
            }
            .validate(),
            Err(TxParamsError::ZeroNstart)
        );
    }

    #[test]
    fn parses_from_config() {
        let params: UdpTxParams = serde_json::from_str(
            r#"{"ack_timeout": "3s", "ack_random_factor": 2.0, "max_retransmit": 2, "nstart": 1}"#,
        )
        .expect("valid config");
        assert_eq!(params.ack_timeout, Duration::from_secs(3));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(42));
    }
}
