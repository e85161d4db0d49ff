//! Error types, one enum per layer.
//!
//! The codec layers (`protocol::frame`, `protocol::services`, `protocol::cemi`)
//! report [`FrameError`], addressing reports [`AddressError`], datapoint types
//! report [`DptError`]. Session operations surface [`TunnelError`], which also
//! wraps the lower layers.

use std::io;
use thiserror::Error;

/// Errors produced by the KNXnet/IP frame codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The datagram or structure is shorter than its fixed layout requires.
    #[error("truncated frame: {actual} bytes, need at least {needed}")]
    Truncated { actual: usize, needed: usize },

    /// Header length octet is not 0x06.
    #[error("invalid header length {0:#04x}")]
    InvalidHeaderLength(u8),

    /// Protocol version octet is not 0x10.
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    /// Service type identifier is not one this client handles.
    #[error("unknown service type {0:#06x}")]
    UnknownService(u16),

    /// The total-length field disagrees with the received datagram.
    #[error("frame length field says {declared} bytes, datagram has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// A nested structure (HPAI, CRI, connection header) has a bad length octet.
    #[error("invalid structure length {0:#04x}")]
    InvalidStructure(u8),

    /// cEMI payload is too short to carry a message code.
    #[error("empty cEMI payload")]
    EmptyCemi,

    /// cEMI message code is not an L_Data code.
    #[error("unexpected cEMI message code {0:#04x}")]
    UnexpectedMessageCode(u8),
}

/// Errors produced when constructing or parsing KNX addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// An address component exceeds its bit width.
    #[error("address component out of range")]
    OutOfRange,

    /// The textual form could not be parsed.
    #[error("malformed address {0:?}")]
    Malformed(String),
}

/// Errors produced by datapoint-type encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DptError {
    /// The payload size does not match the datapoint type.
    #[error("payload size does not match the datapoint type")]
    InvalidData,

    /// The value cannot be represented by the datapoint type.
    #[error("value out of range for the datapoint type")]
    OutOfRange,
}

/// Errors surfaced by tunnel session operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The operation was cancelled by [`close`](crate::Tunnel::close) or an
    /// external cancellation. Not a fault.
    #[error("operation cancelled")]
    Cancelled,

    /// No response arrived within the configured response timeout.
    #[error("no response within the response timeout")]
    Timeout,

    /// The socket's inbound stream has been closed; the session is dead.
    #[error("socket inbound stream closed")]
    InboundClosed,

    /// The gateway denied the connect request with a non-busy, non-ok status.
    #[error("connect request rejected with status {0:#04x}")]
    ConnectRejected(u8),

    /// The gateway acknowledged a tunneling request with a non-zero status.
    #[error("tunneling request rejected with status {0:#04x}")]
    TunnelRejected(u8),

    /// A connection state probe timed out or reported a bad state.
    #[error("heartbeat did not succeed")]
    HeartbeatFailed,

    /// The gateway terminated the connection and reconnecting failed.
    #[error("gateway terminated the connection")]
    Disconnected,

    /// An inbound frame violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    /// Transport-level I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}
