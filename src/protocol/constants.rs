//! KNXnet/IP protocol constants and identifier enums.

/// KNXnet/IP protocol version 1.0.
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes).
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication.
pub const KNXNETIP_PORT: u16 = 3671;

/// Upper bound on a KNXnet/IP datagram this client will process.
pub const MAX_FRAME_SIZE: usize = 512;

/// Service type identifiers for the core and tunneling services.
///
/// Discovery, device management, routing and secure services are out of
/// scope for a tunnel client; datagrams carrying them fail to decode and
/// are dropped by the socket reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    /// `CONNECT_REQUEST` - open a tunnel channel
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - channel assignment or denial
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - liveness probe (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - probe result
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - close the channel (either side)
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - close acknowledgement
    DisconnectResponse = 0x020A,
    /// `TUNNELING_REQUEST` - cEMI frame in either direction
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - acknowledgement for a tunneling request
    TunnelingAck = 0x0421,
}

impl ServiceType {
    /// Map a wire identifier to a `ServiceType`.
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionStateRequest),
            0x0208 => Some(Self::ConnectionStateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            _ => None,
        }
    }

    /// Wire identifier of this service.
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Connection type code for a tunnel connection (CRI/CRD).
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX layer for link-layer tunneling (`TunnelLayerData`).
pub const TUNNEL_LAYER_DATA: u8 = 0x02;

/// Host protocol code for IPv4 UDP.
pub const IPV4_UDP: u8 = 0x01;

// Gateway status codes carried in response frames.

/// Operation succeeded.
pub const E_NO_ERROR: u8 = 0x00;
/// Requested connection type is not supported.
pub const E_CONNECTION_TYPE: u8 = 0x22;
/// Requested connection option is not supported.
pub const E_CONNECTION_OPTION: u8 = 0x23;
/// No free channel available; the gateway is busy.
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;
/// Error on the data connection.
pub const E_DATA_CONNECTION: u8 = 0x26;
/// Error on the KNX subnetwork connection.
pub const E_KNX_CONNECTION: u8 = 0x27;
/// Requested tunneling layer is not supported.
pub const E_TUNNELLING_LAYER: u8 = 0x29;

// Connection state codes reported by CONNECTIONSTATE_RESPONSE.

/// The channel is operating normally.
pub const CONN_STATE_NORMAL: u8 = 0x00;
/// The channel is inactive.
pub const CONN_STATE_INACTIVE: u8 = 0x21;
/// Error on the data connection.
pub const CONN_STATE_DATA_ERROR: u8 = 0x26;
/// Error on the KNX connection.
pub const CONN_STATE_KNX_ERROR: u8 = 0x27;

/// cEMI message codes for the L_Data primitives a tunnel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CemiMessageCode {
    /// `L_Data.req` - request from client to bus
    LDataReq = 0x11,
    /// `L_Data.ind` - indication from bus to client
    LDataInd = 0x29,
    /// `L_Data.con` - confirmation of an earlier request
    LDataCon = 0x2E,
}

impl CemiMessageCode {
    /// Map a wire code to a `CemiMessageCode`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::LDataReq),
            0x29 => Some(Self::LDataInd),
            0x2E => Some(Self::LDataCon),
            _ => None,
        }
    }

    /// Wire code of this message.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// KNX message priority carried in control field 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority
    #[default]
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Decode from the two priority bits.
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// The two priority bits.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}
