#![doc = include_str!("../README.md")]
//!
//! # Architecture
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol::frame`] / [`protocol::services`] - the KNXnet/IP wire codec
//!   and the closed [`Frame`](protocol::services::Frame) union
//! - [`protocol::cemi`] - the cEMI payloads a tunnel carries
//! - [`net`] - the datagram [`Transport`](net::Transport) abstraction with
//!   UDP and in-memory mock implementations
//! - [`protocol::tunnel`] - the tunnel session itself: handshake, sequenced
//!   send/ack, inbound dispatch, heartbeat and supervised reconnect
//! - [`addressing`] and [`dpt`] - KNX addresses and datapoint types for
//!   interpreting group traffic
//!
//! Logging goes through the [`log`] facade; install any compatible logger
//! to see it.

pub mod addressing;
pub mod dpt;
pub mod error;
pub mod net;
pub mod protocol;

#[doc(inline)]
pub use addressing::{GroupAddress, IndividualAddress};
#[doc(inline)]
pub use error::TunnelError;
#[doc(inline)]
pub use protocol::cemi::CemiFrame;
#[doc(inline)]
pub use protocol::tunnel::{Tunnel, TunnelConfig};
