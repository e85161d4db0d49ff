//! Network transports and frame-level socket plumbing.

pub mod mock_transport;
pub(crate) mod socket;
pub mod transport;

#[doc(inline)]
pub use mock_transport::{MockGateway, MockTransport};
#[doc(inline)]
pub use transport::{Transport, UdpTransport};
