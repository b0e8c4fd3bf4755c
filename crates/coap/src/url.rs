// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! `coap://`-family URL parsing.
//!
//! Hostname and port are extracted (default ports 5683/5684), path and query
//! segments are percent-decoded into ordered lists that later become CoAP
//! Uri-Path / Uri-Query options, in order.

use crate::options::Options;
use url::Url;

/// Transport selected by the URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// `coap://` — plain UDP.
    Udp,
    /// `coaps://` — DTLS.
    Dtls,
    /// `coap+tcp://` — plain TCP.
    #[cfg(feature = "tcp")]
    Tcp,
    /// `coaps+tcp://` — TLS.
    #[cfg(feature = "tcp")]
    Tls,
}

impl TransportKind {
    /// True for DTLS/TLS schemes.
    #[must_use]
    pub fn is_secure(self) -> bool {
        match self {
            TransportKind::Udp => false,
            TransportKind::Dtls => true,
            #[cfg(feature = "tcp")]
            TransportKind::Tcp => false,
            #[cfg(feature = "tcp")]
            TransportKind::Tls => true,
        }
    }

    fn default_port(self) -> u16 {
        if self.is_secure() { 5684 } else { 5683 }
    }
}

/// Errors produced while parsing a CoAP URL.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlError {
    /// The string is not a URL at all.
    #[error("malformed URL: {0}")]
    Malformed(String),
    /// The scheme is not in the `coap` family (or not compiled in).
    #[error("unsupported URL scheme `{0}`")]
    UnsupportedScheme(String),
    /// The URL has no host part.
    #[error("URL has no host")]
    NoHost,
    /// A path or query segment carries invalid percent-encoding.
    #[error("invalid percent-encoding in `{0}`")]
    BadEscape(String),
}

/// A parsed CoAP URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoapUrl {
    /// Transport selected by the scheme.
    pub kind: TransportKind,
    /// Hostname or address literal.
    pub host: String,
    /// Port, with the scheme default applied.
    pub port: u16,
    /// Percent-decoded path segments, in order.
    pub path_segments: Vec<String>,
    /// Percent-decoded query segments, in order.
    pub query_segments: Vec<String>,
}

fn decode(segment: &str) -> Result<String, UrlError> {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| UrlError::BadEscape(segment.to_owned()))
}

impl CoapUrl {
    /// Parses and validates a CoAP URL.
    pub fn parse(raw: &str) -> Result<CoapUrl, UrlError> {
        let url = Url::parse(raw).map_err(|err| UrlError::Malformed(err.to_string()))?;
        let kind = match url.scheme() {
            "coap" => TransportKind::Udp,
            "coaps" => TransportKind::Dtls,
            #[cfg(feature = "tcp")]
            "coap+tcp" => TransportKind::Tcp,
            #[cfg(feature = "tcp")]
            "coaps+tcp" => TransportKind::Tls,
            other => return Err(UrlError::UnsupportedScheme(other.to_owned())),
        };
        let host = url.host_str().ok_or(UrlError::NoHost)?.to_owned();
        let port = url.port().unwrap_or_else(|| kind.default_port());

        let mut path_segments = Vec::new();
        if let Some(segments) = url.path_segments() {
            for segment in segments.filter(|segment| !segment.is_empty()) {
                path_segments.push(decode(segment)?);
            }
        }
        let mut query_segments = Vec::new();
        if let Some(query) = url.query() {
            for segment in query.split('&').filter(|segment| !segment.is_empty()) {
                query_segments.push(decode(segment)?);
            }
        }

        Ok(CoapUrl {
            kind,
            host,
            port,
            path_segments,
            query_segments,
        })
    }

    /// Renders the path/query segments as request options, in order.
    #[must_use]
    pub fn to_options(&self) -> Options {
        let mut options = Options::new();
        for segment in &self.path_segments {
            options.add_uri_path(segment.clone());
        }
        for segment in &self.query_segments {
            options.add_uri_query(segment.clone());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_coap() {
        let url = CoapUrl::parse("coap://127.0.0.1/firmware/image.bin?v=2").expect("valid");
        assert_eq!(url.kind, TransportKind::Udp);
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 5683);
        assert_eq!(url.path_segments, ["firmware", "image.bin"]);
        assert_eq!(url.query_segments, ["v=2"]);
    }

    #[test]
    fn secure_scheme_changes_default_port() {
        let url = CoapUrl::parse("coaps://device.example.com").expect("valid");
        assert_eq!(url.kind, TransportKind::Dtls);
        assert_eq!(url.port, 5684);
        assert!(url.path_segments.is_empty());
    }

    #[test]
    fn explicit_port_wins() {
        let url = CoapUrl::parse("coap://host:61616").expect("valid");
        assert_eq!(url.port, 61616);
    }

    #[test]
    fn percent_decoding() {
        let url = CoapUrl::parse("coap://host/a%20b/c%2Fd").expect("valid");
        assert_eq!(url.path_segments, ["a b", "c/d"]);
    }

    #[test]
    fn rejects_foreign_schemes() {
        assert_eq!(
            CoapUrl::parse("http://host/"),
            Err(UrlError::UnsupportedScheme("http".to_owned()))
        );
    }

    #[cfg(feature = "tcp")]
    #[test]
    fn tcp_schemes_when_compiled_in() {
        assert_eq!(
            CoapUrl::parse("coap+tcp://host").map(|url| url.kind),
            Ok(TransportKind::Tcp)
        );
        assert_eq!(
            CoapUrl::parse("coaps+tcp://host").map(|url| url.kind),
            Ok(TransportKind::Tls)
        );
    }
}
