// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! CoAP options used by the runtime: content formats, ETags, Uri-Path /
//! Uri-Query lists and BLOCK2 size negotiation.

use std::fmt;

/// Content formats the notify pipeline can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentFormat {
    /// `text/plain;charset=utf-8` (0)
    PlainText,
    /// `application/octet-stream` (42)
    Opaque,
    /// `application/vnd.oma.lwm2m+tlv` (11542)
    Tlv,
    /// `application/senml+json` (110)
    SenmlJson,
    /// `application/senml+cbor` (112)
    SenmlCbor,
}

impl ContentFormat {
    /// The numeric Content-Format option value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            ContentFormat::PlainText => 0,
            ContentFormat::Opaque => 42,
            ContentFormat::SenmlJson => 110,
            ContentFormat::SenmlCbor => 112,
            ContentFormat::Tlv => 11542,
        }
    }
}

/// Errors produced when constructing an [`Etag`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EtagError {
    /// CoAP ETags are at most 8 bytes.
    #[error("ETag of {len} bytes exceeds the 8-byte limit")]
    TooLong {
        /// Length of the rejected ETag.
        len: usize,
    },
}

/// A server-issued opaque version tag, 1–8 bytes on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Etag {
    len: u8,
    bytes: [u8; Etag::MAX_SIZE],
}

impl Etag {
    /// Maximum ETag length in bytes.
    pub const MAX_SIZE: usize = 8;

    /// Creates an ETag from raw bytes.
    pub fn new(bytes: &[u8]) -> Result<Etag, EtagError> {
        if bytes.len() > Etag::MAX_SIZE {
            return Err(EtagError::TooLong { len: bytes.len() });
        }
        let mut buf = [0u8; Etag::MAX_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Etag {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// The tag bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

impl fmt::Debug for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Etag(")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// An ordered list of the request options the runtime emits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    uri_path: Vec<String>,
    uri_query: Vec<String>,
}

impl Options {
    /// Creates an empty option list.
    #[must_use]
    pub fn new() -> Options {
        Options::default()
    }

    /// Appends one Uri-Path segment; order is preserved on the wire.
    pub fn add_uri_path(&mut self, segment: impl Into<String>) {
        self.uri_path.push(segment.into());
    }

    /// Appends one Uri-Query segment; order is preserved on the wire.
    pub fn add_uri_query(&mut self, segment: impl Into<String>) {
        self.uri_query.push(segment.into());
    }

    /// The Uri-Path segments in wire order.
    #[must_use]
    pub fn uri_path(&self) -> &[String] {
        &self.uri_path
    }

    /// The Uri-Query segments in wire order.
    #[must_use]
    pub fn uri_query(&self) -> &[String] {
        &self.uri_query
    }
}

/// Smallest BLOCK2 size the protocol allows.
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest BLOCK2 size the protocol allows.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// The initial BLOCK2 size for a transfer: the largest power of two that fits
/// into `buffer_capacity` after subtracting `header_overhead`, clamped to the
/// protocol range. `None` means the buffer cannot hold any legal block.
#[must_use]
pub fn negotiated_block_size(buffer_capacity: usize, header_overhead: usize) -> Option<usize> {
    let available = buffer_capacity.checked_sub(header_overhead)?;
    if available < MIN_BLOCK_SIZE {
        return None;
    }
    let mut size = MAX_BLOCK_SIZE;
    while size > available {
        size /= 2;
    }
    Some(size)
}
