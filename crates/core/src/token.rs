// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! CoAP tokens used as observation identities.

use std::cmp::Ordering;
use std::fmt;

/// Errors produced when constructing a [`Token`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    /// CoAP tokens are at most 8 bytes long.
    #[error("token of {len} bytes exceeds the 8-byte CoAP limit")]
    TooLong {
        /// Length of the rejected token.
        len: usize,
    },
}

/// A CoAP token: 0 to 8 opaque bytes.
///
/// Equality is byte-exact. The ordering is length-first, then lexicographic
/// over the bytes, which is the comparator the observe registry sorts by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; Token::MAX_SIZE],
}

impl Token {
    /// Maximum token length in bytes.
    pub const MAX_SIZE: usize = 8;

    /// Creates a token from raw bytes.
    pub fn new(bytes: &[u8]) -> Result<Token, TokenError> {
        if bytes.len() > Token::MAX_SIZE {
            return Err(TokenError::TooLong { len: bytes.len() });
        }
        let mut buf = [0u8; Token::MAX_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Token {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// The token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Token length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// True for the zero-length token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Token) -> Ordering {
        self.len
            .cmp(&other.len)
            .then_with(|| self.as_bytes().cmp(other.as_bytes()))
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Token) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_tokens() {
        assert_eq!(
            Token::new(&[0u8; 9]),
            Err(TokenError::TooLong { len: 9 })
        );
        assert!(Token::new(&[0u8; 8]).is_ok());
    }

    #[test]
    fn orders_by_length_then_bytes() {
        let empty = Token::default();
        let short_hi = Token::new(&[0xff]).expect("valid");
        let long_lo = Token::new(&[0x00, 0x00]).expect("valid");
        let long_hi = Token::new(&[0x00, 0x01]).expect("valid");

        assert!(empty < short_hi);
        assert!(short_hi < long_lo);
        assert!(long_lo < long_hi);
    }

    #[test]
    fn equality_is_byte_exact() {
        let a = Token::new(&[1, 2, 3]).expect("valid");
        let b = Token::new(&[1, 2, 3]).expect("valid");
        let c = Token::new(&[1, 2]).expect("valid");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn displays_as_hex() {
        let token = Token::new(&[0xde, 0xad, 0x01]).expect("valid");
        assert_eq!(token.to_string(), "dead01");
    }
}
