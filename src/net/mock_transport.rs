//! In-memory transport for tests.
//!
//! [`MockTransport::pair`] creates both ends of a simulated datagram link:
//! the transport the client plugs into the session, and a [`MockGateway`]
//! handle with which a test scripts the gateway's side of the conversation.
//!
//! ```rust
//! use knx_tunnel::net::{MockTransport, Transport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (transport, mut gateway) = MockTransport::pair();
//!
//! transport.send(&[0x06, 0x10]).await.unwrap();
//! assert_eq!(gateway.recv_raw().await.unwrap(), [0x06, 0x10]);
//! # }
//! ```

use std::io;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::services::Frame;

use super::transport::Transport;

/// Client end of an in-memory datagram link.
pub struct MockTransport {
    to_gateway: mpsc::UnboundedSender<Vec<u8>>,
    from_gateway: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Test-side handle playing the gateway.
///
/// Dropping the handle closes the link: the client's next receive fails and
/// the session observes a dead socket.
pub struct MockGateway {
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransport {
    /// Create a connected transport/gateway pair.
    pub fn pair() -> (MockTransport, MockGateway) {
        let (to_gateway, from_client) = mpsc::unbounded_channel();
        let (to_client, from_gateway) = mpsc::unbounded_channel();
        (
            MockTransport { to_gateway, from_gateway: Mutex::new(from_gateway) },
            MockGateway { from_client, to_client },
        )
    }
}

impl Transport for MockTransport {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.to_gateway
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gateway closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self
            .from_gateway
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "gateway closed"))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }
}

impl MockGateway {
    /// Receive the next datagram the client sent.
    pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Receive and decode the next frame the client sent.
    ///
    /// Panics on undecodable datagrams; the client under test must not emit
    /// them.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let datagram = self.recv_raw().await?;
        Some(Frame::decode(&datagram).expect("client sent an undecodable datagram"))
    }

    /// Send raw bytes to the client.
    pub fn send_raw(&self, datagram: Vec<u8>) {
        let _ = self.to_client.send(datagram);
    }

    /// Encode and send a frame to the client.
    pub fn send_frame(&self, frame: &Frame) {
        self.send_raw(frame.encode());
    }
}
