//! Typed bodies for the tunneling services and the [`Frame`] union.
//!
//! Received datagrams decode into exactly one [`Frame`] variant; the
//! dispatcher matches on the tag. Outbound frames encode through
//! [`Frame::encode`], which produces a complete datagram including the
//! KNXnet/IP header.
//!
//! ```text
//! Client                          Gateway
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::error::FrameError;
use crate::protocol::cemi::CemiFrame;
use crate::protocol::constants::{ServiceType, TUNNEL_CONNECTION, TUNNEL_LAYER_DATA};
use crate::protocol::frame::{FrameHeader, Hpai};

/// Size of the connection header carried by tunneling frames.
const CONNECTION_HEADER_SIZE: usize = 4;

/// Connection Request Information for a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cri {
    /// Connection type, `TUNNEL_CONNECTION` for this client.
    pub connection_type: u8,
    /// Requested KNX layer.
    pub layer: u8,
}

impl Cri {
    const SIZE: usize = 4;

    /// CRI requesting link-layer tunneling.
    pub const fn tunnel_layer_data() -> Self {
        Self { connection_type: TUNNEL_CONNECTION, layer: TUNNEL_LAYER_DATA }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(Self::SIZE as u8);
        out.push(self.connection_type);
        out.push(self.layer);
        out.push(0x00);
    }

    fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::SIZE {
            return Err(FrameError::Truncated { actual: data.len(), needed: Self::SIZE });
        }
        if data[0] != Self::SIZE as u8 {
            return Err(FrameError::InvalidStructure(data[0]));
        }
        Ok(Self { connection_type: data[1], layer: data[2] })
    }
}

/// `CONNECT_REQUEST` (0x0205).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Endpoint for control traffic.
    pub control: Hpai,
    /// Endpoint for tunnel data.
    pub data: Hpai,
    /// Requested connection kind and layer.
    pub cri: Cri,
}

impl ConnectRequest {
    /// Connect request for link-layer tunneling in NAT mode: the gateway
    /// replies to the source address of the datagram.
    pub const fn tunnel() -> Self {
        Self {
            control: Hpai::UNSPECIFIED,
            data: Hpai::UNSPECIFIED,
            cri: Cri::tunnel_layer_data(),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        self.control.encode_into(out);
        self.data.encode_into(out);
        self.cri.encode_into(out);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        let control = Hpai::parse(body)?;
        let data = Hpai::parse(&body[Hpai::SIZE..])?;
        let cri = Cri::parse(&body[2 * Hpai::SIZE..])?;
        Ok(Self { control, data, cri })
    }
}

/// `CONNECT_RESPONSE` (0x0206).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Channel id assigned by the gateway; meaningless unless `status` is ok.
    pub channel: u8,
    /// Gateway status code, `E_NO_ERROR` on success.
    pub status: u8,
    /// Endpoint the gateway expects control traffic on.
    pub control: Hpai,
}

impl ConnectResponse {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(self.status);
        self.control.encode_into(out);
        // CRD for a tunnel connection; the assigned KNX address is not used
        // by this client.
        out.extend_from_slice(&[4, TUNNEL_CONNECTION, 0x00, 0x00]);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 2 {
            return Err(FrameError::Truncated { actual: body.len(), needed: 2 });
        }
        let channel = body[0];
        let status = body[1];
        // Denials are sometimes sent as the bare two status bytes.
        let control =
            if body.len() >= 2 + Hpai::SIZE { Hpai::parse(&body[2..])? } else { Hpai::UNSPECIFIED };
        Ok(Self { channel, status, control })
    }
}

/// `CONNECTIONSTATE_REQUEST` (0x0207).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Channel being probed.
    pub channel: u8,
    /// Control endpoint of the requester.
    pub control: Hpai,
}

impl ConnectionStateRequest {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(0x00);
        self.control.encode_into(out);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 2 + Hpai::SIZE {
            return Err(FrameError::Truncated { actual: body.len(), needed: 2 + Hpai::SIZE });
        }
        Ok(Self { channel: body[0], control: Hpai::parse(&body[2..])? })
    }
}

/// `CONNECTIONSTATE_RESPONSE` (0x0208).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Channel the probe referred to.
    pub channel: u8,
    /// Connection state code, `CONN_STATE_NORMAL` when healthy.
    pub status: u8,
}

impl ConnectionStateResponse {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(self.status);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 2 {
            return Err(FrameError::Truncated { actual: body.len(), needed: 2 });
        }
        Ok(Self { channel: body[0], status: body[1] })
    }
}

/// `DISCONNECT_REQUEST` (0x0209), sent by either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Channel being closed.
    pub channel: u8,
    /// Control endpoint of the requester.
    pub control: Hpai,
}

impl DisconnectRequest {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(0x00);
        self.control.encode_into(out);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 2 {
            return Err(FrameError::Truncated { actual: body.len(), needed: 2 });
        }
        let control =
            if body.len() >= 2 + Hpai::SIZE { Hpai::parse(&body[2..])? } else { Hpai::UNSPECIFIED };
        Ok(Self { channel: body[0], control })
    }
}

/// `DISCONNECT_RESPONSE` (0x020A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Channel that was closed.
    pub channel: u8,
    /// Status code, `E_NO_ERROR` for an orderly close.
    pub status: u8,
}

impl DisconnectResponse {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.push(self.status);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 2 {
            return Err(FrameError::Truncated { actual: body.len(), needed: 2 });
        }
        Ok(Self { channel: body[0], status: body[1] })
    }
}

/// `TUNNELING_REQUEST` (0x0420): a cEMI frame in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelingRequest {
    /// Channel the frame belongs to.
    pub channel: u8,
    /// Sequence number in the sender's direction.
    pub seq: u8,
    /// The carried cEMI frame, opaque at this layer.
    pub payload: CemiFrame,
}

impl TunnelingRequest {
    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(CONNECTION_HEADER_SIZE as u8);
        out.push(self.channel);
        out.push(self.seq);
        out.push(0x00);
        out.extend_from_slice(self.payload.as_bytes());
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < CONNECTION_HEADER_SIZE {
            return Err(FrameError::Truncated { actual: body.len(), needed: CONNECTION_HEADER_SIZE });
        }
        if body[0] != CONNECTION_HEADER_SIZE as u8 {
            return Err(FrameError::InvalidStructure(body[0]));
        }
        let payload = CemiFrame::from_raw(body[CONNECTION_HEADER_SIZE..].to_vec())?;
        Ok(Self { channel: body[1], seq: body[2], payload })
    }
}

/// `TUNNELING_ACK` (0x0421).
///
/// The fourth octet of the connection header carries the status;
/// `E_NO_ERROR` acknowledges the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingAck {
    /// Channel the acknowledgement belongs to.
    pub channel: u8,
    /// Sequence number being acknowledged.
    pub seq: u8,
    /// Status code, zero on success.
    pub status: u8,
}

impl TunnelingAck {
    /// Whether the request was accepted.
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.push(CONNECTION_HEADER_SIZE as u8);
        out.push(self.channel);
        out.push(self.seq);
        out.push(self.status);
    }

    fn parse_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < CONNECTION_HEADER_SIZE {
            return Err(FrameError::Truncated { actual: body.len(), needed: CONNECTION_HEADER_SIZE });
        }
        if body[0] != CONNECTION_HEADER_SIZE as u8 {
            return Err(FrameError::InvalidStructure(body[0]));
        }
        Ok(Self { channel: body[1], seq: body[2], status: body[3] })
    }
}

/// A complete KNXnet/IP frame, tagged by service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `CONNECT_REQUEST`
    ConnectRequest(ConnectRequest),
    /// `CONNECT_RESPONSE`
    ConnectResponse(ConnectResponse),
    /// `CONNECTIONSTATE_REQUEST`
    ConnectionStateRequest(ConnectionStateRequest),
    /// `CONNECTIONSTATE_RESPONSE`
    ConnectionStateResponse(ConnectionStateResponse),
    /// `DISCONNECT_REQUEST`
    DisconnectRequest(DisconnectRequest),
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse(DisconnectResponse),
    /// `TUNNELING_REQUEST`
    TunnelingRequest(TunnelingRequest),
    /// `TUNNELING_ACK`
    TunnelingAck(TunnelingAck),
}

impl Frame {
    /// The service this frame carries.
    pub const fn service_type(&self) -> ServiceType {
        match self {
            Frame::ConnectRequest(_) => ServiceType::ConnectRequest,
            Frame::ConnectResponse(_) => ServiceType::ConnectResponse,
            Frame::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Frame::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Frame::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Frame::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Frame::TunnelingRequest(_) => ServiceType::TunnelingRequest,
            Frame::TunnelingAck(_) => ServiceType::TunnelingAck,
        }
    }

    /// Encode the frame into a complete datagram, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FrameHeader::SIZE + 24);
        FrameHeader::encode_into(self.service_type(), &mut out);
        match self {
            Frame::ConnectRequest(body) => body.encode_body(&mut out),
            Frame::ConnectResponse(body) => body.encode_body(&mut out),
            Frame::ConnectionStateRequest(body) => body.encode_body(&mut out),
            Frame::ConnectionStateResponse(body) => body.encode_body(&mut out),
            Frame::DisconnectRequest(body) => body.encode_body(&mut out),
            Frame::DisconnectResponse(body) => body.encode_body(&mut out),
            Frame::TunnelingRequest(body) => body.encode_body(&mut out),
            Frame::TunnelingAck(body) => body.encode_body(&mut out),
        }
        FrameHeader::patch_length(&mut out);
        out
    }

    /// Decode one datagram into a frame.
    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        let header = FrameHeader::parse(datagram)?;
        let declared = header.total_length as usize;
        if declared < FrameHeader::SIZE || declared > datagram.len() {
            return Err(FrameError::LengthMismatch { declared, actual: datagram.len() });
        }
        let body = &datagram[FrameHeader::SIZE..declared];

        match header.service {
            ServiceType::ConnectRequest => {
                ConnectRequest::parse_body(body).map(Frame::ConnectRequest)
            }
            ServiceType::ConnectResponse => {
                ConnectResponse::parse_body(body).map(Frame::ConnectResponse)
            }
            ServiceType::ConnectionStateRequest => {
                ConnectionStateRequest::parse_body(body).map(Frame::ConnectionStateRequest)
            }
            ServiceType::ConnectionStateResponse => {
                ConnectionStateResponse::parse_body(body).map(Frame::ConnectionStateResponse)
            }
            ServiceType::DisconnectRequest => {
                DisconnectRequest::parse_body(body).map(Frame::DisconnectRequest)
            }
            ServiceType::DisconnectResponse => {
                DisconnectResponse::parse_body(body).map(Frame::DisconnectResponse)
            }
            ServiceType::TunnelingRequest => {
                TunnelingRequest::parse_body(body).map(Frame::TunnelingRequest)
            }
            ServiceType::TunnelingAck => TunnelingAck::parse_body(body).map(Frame::TunnelingAck),
        }
    }
}
