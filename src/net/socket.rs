//! Frame-level plumbing over a [`Transport`].
//!
//! [`start`] spawns the reader task that owns the transport's receive side,
//! decodes datagrams and feeds the session's single inbound frame stream.
//! Undecodable datagrams are logged and dropped; the session continues.
//! [`FrameSender`] is the outbound half, safe for concurrent callers.

use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::protocol::constants::MAX_FRAME_SIZE;
use crate::protocol::services::Frame;

use super::transport::Transport;

/// Decoded frames buffered between the reader task and the dispatcher.
const INBOUND_FRAME_QUEUE: usize = 16;

/// Outbound half of the socket.
pub(crate) struct FrameSender<T> {
    transport: Arc<T>,
}

impl<T: Transport> FrameSender<T> {
    /// Encode and transmit one frame.
    pub(crate) async fn send(&self, frame: &Frame) -> Result<(), TunnelError> {
        trace!("sending {:?}", frame.service_type());
        self.transport.send(&frame.encode()).await?;
        Ok(())
    }
}

/// Split a transport into a sender and the inbound frame stream.
///
/// The reader task ends when the token is cancelled, the transport dies, or
/// the receiver is dropped; in every case the stream closes and the
/// dispatcher observes the end of input.
pub(crate) fn start<T: Transport>(
    transport: T,
    cancel: CancellationToken,
) -> (FrameSender<T>, mpsc::Receiver<Frame>) {
    let transport = Arc::new(transport);
    let (frames_tx, frames_rx) = mpsc::channel(INBOUND_FRAME_QUEUE);
    tokio::spawn(read_loop(Arc::clone(&transport), frames_tx, cancel));
    (FrameSender { transport }, frames_rx)
}

async fn read_loop<T: Transport>(
    transport: Arc<T>,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(err) => {
                    debug!("socket receive failed: {err}");
                    break;
                }
            },
        };

        match Frame::decode(&buf[..len]) {
            Ok(frame) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("dropping undecodable datagram: {err}"),
        }
    }
}
