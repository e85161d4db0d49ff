//! Datagram transport abstraction toward the gateway.
//!
//! The tunnel session depends on [`Transport`] rather than a concrete
//! socket, so the protocol logic can be exercised against the in-memory
//! [`MockTransport`](crate::net::MockTransport) and alternative transports
//! can be plugged in.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// An exchanger of datagrams with one gateway.
///
/// `send` must be safe for concurrent callers; the session's supervisor,
/// sender and heartbeat tasks all transmit through the same transport.
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to the gateway.
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next datagram from the gateway into `buf`, returning its
    /// length. Resolves with an error once the transport is unusable.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// UDP transport connected to a single gateway endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `gateway`
    /// (e.g. `"192.168.1.10:3671"`).
    ///
    /// Connecting filters inbound traffic to the gateway's address and lets
    /// the send path omit the destination.
    pub async fn connect(gateway: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(gateway).await?;
        Ok(Self { socket })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}
