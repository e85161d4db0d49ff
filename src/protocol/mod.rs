//! KNXnet/IP protocol layer: constants, frame codec, service bodies, cEMI
//! and the tunnel session.

pub mod cemi;
pub mod constants;
pub mod frame;
pub mod services;
pub mod tunnel;
