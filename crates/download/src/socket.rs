// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Transfer sockets.
//!
//! Every transfer owns a dedicated socket, created for the URL's transport by
//! a [`SocketFactory`]. Secure transports are provided by the host (their
//! handshake machinery is none of the downloader's business); the only fact
//! the downloader ever asks about them is whether the last reconnect resumed
//! the previous (D)TLS session.

use async_trait::async_trait;
use lwm2m_coap::{SocketError, TransportKind};
use tokio::net::UdpSocket;

/// A connected transfer socket.
///
/// `shutdown` disables traffic while keeping the remote address for later
/// resumption; `close` additionally releases the descriptor. A reconnect is
/// `shutdown` + `close` + `connect` to the previously recorded remote.
#[async_trait(?Send)]
pub trait TransferSocket {
    /// Connects (or reconnects) to `host:port`.
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), SocketError>;

    /// Stops traffic without forgetting the remote address.
    fn shutdown(&mut self) -> Result<(), SocketError>;

    /// Releases the descriptor.
    fn close(&mut self) -> Result<(), SocketError>;

    /// The connected remote host, if known.
    fn remote_host(&self) -> Option<String>;

    /// The connected remote port, if known.
    fn remote_port(&self) -> Option<u16>;

    /// The bound local port, if any.
    fn local_port(&self) -> Option<u16>;

    /// Whether the last `connect` resumed the previous security session.
    /// Plain transports always resume trivially.
    fn session_resumed(&self) -> bool;
}

/// Creates transfer sockets per transport kind.
#[async_trait(?Send)]
pub trait SocketFactory {
    /// Creates an unconnected socket for `kind`.
    async fn create(&mut self, kind: TransportKind) -> Result<Box<dyn TransferSocket>, SocketError>;
}

/// A plain UDP transfer socket bound to an ephemeral local port.
#[derive(Default)]
pub struct UdpTransferSocket {
    socket: Option<UdpSocket>,
    remote: Option<(String, u16)>,
    shut_down: bool,
}

impl UdpTransferSocket {
    /// Creates an unconnected socket.
    #[must_use]
    pub fn new() -> UdpTransferSocket {
        UdpTransferSocket::default()
    }

    /// The inner tokio socket, once connected.
    #[must_use]
    pub fn inner(&self) -> Option<&UdpSocket> {
        self.socket.as_ref()
    }
}

#[async_trait(?Send)]
impl TransferSocket for UdpTransferSocket {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), SocketError> {
        let socket = match self.socket.take() {
            Some(socket) if !self.shut_down => socket,
            _ => UdpSocket::bind(("0.0.0.0", 0)).await.map_err(SocketError::Io)?,
        };
        socket
            .connect((host, port))
            .await
            .map_err(SocketError::Io)?;
        self.socket = Some(socket);
        self.remote = Some((host.to_owned(), port));
        self.shut_down = false;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SocketError> {
        // UDP has no half-close; just stop using the descriptor while keeping
        // the remote address for resumption.
        self.shut_down = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SocketError> {
        self.socket = None;
        Ok(())
    }

    fn remote_host(&self) -> Option<String> {
        self.remote.as_ref().map(|(host, _)| host.clone())
    }

    fn remote_port(&self) -> Option<u16> {
        self.remote.as_ref().map(|(_, port)| *port)
    }

    fn local_port(&self) -> Option<u16> {
        self.socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.port())
    }

    fn session_resumed(&self) -> bool {
        true
    }
}

/// Factory producing [`UdpTransferSocket`]s for `coap://` URLs.
#[derive(Debug, Default)]
pub struct UdpSocketFactory;

#[async_trait(?Send)]
impl SocketFactory for UdpSocketFactory {
    async fn create(&mut self, kind: TransportKind) -> Result<Box<dyn TransferSocket>, SocketError> {
        match kind {
            TransportKind::Udp => Ok(Box::new(UdpTransferSocket::new())),
            _ => Err(SocketError::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_socket_connects_and_reconnects() {
        let peer = UdpSocket::bind(("127.0.0.1", 0)).await.expect("peer bound");
        let peer_port = peer.local_addr().expect("peer addr").port();

        let mut socket = UdpTransferSocket::new();
        socket
            .connect("127.0.0.1", peer_port)
            .await
            .expect("connected");
        assert_eq!(socket.remote_host().as_deref(), Some("127.0.0.1"));
        assert_eq!(socket.remote_port(), Some(peer_port));
        let first_local = socket.local_port().expect("bound");
        assert_ne!(first_local, 0);

        // Suspend/resume cycle: shutdown keeps the remote address, close and
        // connect rebind.
        socket.shutdown().expect("shut down");
        assert_eq!(socket.remote_port(), Some(peer_port));
        socket.close().expect("closed");
        let (host, port) = (
            socket.remote_host().expect("host kept"),
            socket.remote_port().expect("port kept"),
        );
        socket.connect(&host, port).await.expect("reconnected");
        assert!(socket.session_resumed());
        assert!(socket.local_port().is_some());
    }

    #[tokio::test]
    async fn udp_factory_rejects_secure_transports() {
        let mut factory = UdpSocketFactory;
        assert!(factory.create(TransportKind::Udp).await.is_ok());
        assert!(matches!(
            factory.create(TransportKind::Dtls).await,
            Err(SocketError::InvalidArgument)
        ));
    }
}
