//! Common External Message Interface (cEMI) frames.
//!
//! A tunnel carries cEMI frames opaquely; this module provides the owned
//! [`CemiFrame`] carrier plus enough of the L_Data codec to build and read
//! group communication:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! │ Additional Info Length (1 byte) + info   │
//! │ Control Field 1 (1 byte)                 │
//! │ Control Field 2 (1 byte)                 │
//! │ Source Address (2 bytes)                 │
//! │ Destination Address (2 bytes)            │
//! │ NPDU Length (1 byte)                     │
//! │ TPCI (1 byte)                            │
//! │ APCI + data (NPDU length bytes)          │
//! └──────────────────────────────────────────┘
//! ```

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::dpt::DptValue;
use crate::error::FrameError;
use crate::protocol::constants::{CemiMessageCode, Priority};

/// Low APCI octet for GroupValue_Write.
const APCI_GROUP_WRITE: u8 = 0x80;
/// Low APCI octet for GroupValue_Response.
const APCI_GROUP_RESPONSE: u8 = 0x40;

/// Control field 1 of an L_Data frame.
///
/// ```text
/// Bit 7: frame type (1 = standard)
/// Bit 5: repeat (0 = repeat allowed)
/// Bit 4: system broadcast (1 = broadcast)
/// Bits 3-2: priority
/// Bit 1: acknowledge requested
/// Bit 0: confirm error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField1 {
    raw: u8,
}

impl ControlField1 {
    /// Raw octet.
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Standard frame flag.
    pub const fn is_standard_frame(self) -> bool {
        self.raw & 0x80 != 0
    }

    /// Message priority.
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    /// Confirm error flag (set on a failed L_Data.con).
    pub const fn has_error(self) -> bool {
        self.raw & 0x01 != 0
    }
}

impl From<u8> for ControlField1 {
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl Default for ControlField1 {
    fn default() -> Self {
        // Standard frame, repeat allowed, broadcast, normal priority.
        Self { raw: 0x94 }
    }
}

/// Control field 2 of an L_Data frame.
///
/// ```text
/// Bit 7: destination type (1 = group address)
/// Bits 6-4: hop count
/// Bits 3-0: extended frame format
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField2 {
    raw: u8,
}

impl ControlField2 {
    /// Raw octet.
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Whether the destination is a group address.
    pub const fn is_group_address(self) -> bool {
        self.raw & 0x80 != 0
    }

    /// Hop count (0-7).
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }
}

impl From<u8> for ControlField2 {
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl Default for ControlField2 {
    fn default() -> Self {
        // Group-addressed, hop count 6, standard format.
        Self { raw: 0xE0 }
    }
}

/// Application layer service of an L_Data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// `A_GroupValue_Read`
    GroupValueRead,
    /// `A_GroupValue_Response`
    GroupValueResponse,
    /// `A_GroupValue_Write`
    GroupValueWrite,
    /// Anything else this client does not interpret.
    Other(u16),
}

impl Apci {
    /// Extract the APCI from the TPCI octet and the first APDU octet.
    ///
    /// The ten APCI bits straddle both octets; for the group value services
    /// the low six bits of the APDU octet carry data and are masked off.
    pub const fn from_octets(tpci: u8, apdu0: u8) -> Self {
        let apci = ((tpci as u16 & 0x03) << 8) | (apdu0 as u16 & 0xC0);
        match apci {
            0x000 => Self::GroupValueRead,
            0x040 => Self::GroupValueResponse,
            0x080 => Self::GroupValueWrite,
            other => Self::Other(other),
        }
    }
}

/// Borrowed view of an L_Data frame inside a [`CemiFrame`].
#[derive(Debug, Clone)]
pub struct LData<'a> {
    /// Which L_Data primitive this is.
    pub code: CemiMessageCode,
    /// Control field 1.
    pub ctrl1: ControlField1,
    /// Control field 2.
    pub ctrl2: ControlField2,
    /// Sending device.
    pub source: IndividualAddress,
    /// Destination, group or individual per `ctrl2`.
    pub destination_raw: u16,
    /// Application service.
    pub apci: Apci,
    /// APDU: the low APCI octet (with embedded small values) followed by any
    /// extended payload octets.
    pub apdu: &'a [u8],
}

impl LData<'_> {
    /// Destination as a group address, if group-addressed.
    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.ctrl2.is_group_address().then(|| GroupAddress::from(self.destination_raw))
    }

    /// Destination as an individual address, if device-addressed.
    pub fn destination_individual(&self) -> Option<IndividualAddress> {
        (!self.ctrl2.is_group_address()).then(|| IndividualAddress::from(self.destination_raw))
    }

    /// Whether this is a group value write.
    pub const fn is_group_write(&self) -> bool {
        matches!(self.apci, Apci::GroupValueWrite)
    }

    /// Whether this is a group value read request.
    pub const fn is_group_read(&self) -> bool {
        matches!(self.apci, Apci::GroupValueRead)
    }

    /// Whether this is a group value response.
    pub const fn is_group_response(&self) -> bool {
        matches!(self.apci, Apci::GroupValueResponse)
    }

    /// Decode the carried value without type information.
    pub fn value(&self) -> Result<DptValue, crate::error::DptError> {
        DptValue::from_apdu(self.apdu)
    }
}

/// An owned cEMI frame, the payload unit of a tunneling request.
///
/// The tunnel treats the content as opaque bytes; [`CemiFrame::as_ldata`]
/// interprets it when the application wants to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CemiFrame {
    data: Vec<u8>,
}

impl CemiFrame {
    /// Minimum size: message code plus additional-info length.
    pub const MIN_SIZE: usize = 2;

    /// Wrap raw cEMI bytes.
    pub fn from_raw(data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() < Self::MIN_SIZE {
            return Err(FrameError::EmptyCemi);
        }
        Ok(Self { data })
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// The message code, when recognized.
    pub fn message_code(&self) -> Option<CemiMessageCode> {
        CemiMessageCode::from_u8(self.data[0])
    }

    /// Build an `L_Data.req` GroupValue_Write.
    pub fn group_write(source: IndividualAddress, destination: GroupAddress, value: &DptValue) -> Self {
        Self::ldata_req(source, destination, |apdu| value.write_apdu(APCI_GROUP_WRITE, apdu))
    }

    /// Build an `L_Data.req` GroupValue_Response, answering a read request.
    pub fn group_response(
        source: IndividualAddress,
        destination: GroupAddress,
        value: &DptValue,
    ) -> Self {
        Self::ldata_req(source, destination, |apdu| value.write_apdu(APCI_GROUP_RESPONSE, apdu))
    }

    /// Build an `L_Data.req` GroupValue_Read.
    pub fn group_read(source: IndividualAddress, destination: GroupAddress) -> Self {
        Self::ldata_req(source, destination, |apdu| apdu.push(0x00))
    }

    fn ldata_req(
        source: IndividualAddress,
        destination: GroupAddress,
        write_apdu: impl FnOnce(&mut Vec<u8>),
    ) -> Self {
        let mut apdu = Vec::with_capacity(5);
        write_apdu(&mut apdu);

        let mut data = Vec::with_capacity(10 + apdu.len());
        data.push(CemiMessageCode::LDataReq.to_u8());
        data.push(0x00);
        data.push(ControlField1::default().raw());
        data.push(ControlField2::default().raw());
        data.extend_from_slice(&source.raw().to_be_bytes());
        data.extend_from_slice(&destination.raw().to_be_bytes());
        data.push(apdu.len() as u8);
        data.push(0x00); // TPCI: unnumbered data
        data.extend_from_slice(&apdu);

        Self { data }
    }

    /// View the frame as L_Data.
    pub fn as_ldata(&self) -> Result<LData<'_>, FrameError> {
        let code = CemiMessageCode::from_u8(self.data[0])
            .ok_or(FrameError::UnexpectedMessageCode(self.data[0]))?;

        let info_len = self.data[1] as usize;
        let service = 2 + info_len;
        // ctrl1, ctrl2, source, destination, NPDU length, TPCI
        let fixed = service + 8;
        if self.data.len() < fixed {
            return Err(FrameError::Truncated { actual: self.data.len(), needed: fixed });
        }

        let npdu_len = self.data[service + 6] as usize;
        if self.data.len() < fixed + npdu_len {
            return Err(FrameError::Truncated { actual: self.data.len(), needed: fixed + npdu_len });
        }

        let tpci = self.data[service + 7];
        let apdu = &self.data[fixed..fixed + npdu_len];
        let apci = match apdu.first() {
            Some(&apdu0) => Apci::from_octets(tpci, apdu0),
            None => Apci::Other(u16::from(tpci) << 8),
        };

        Ok(LData {
            code,
            ctrl1: ControlField1::from(self.data[service]),
            ctrl2: ControlField2::from(self.data[service + 1]),
            source: IndividualAddress::from(u16::from_be_bytes([
                self.data[service + 2],
                self.data[service + 3],
            ])),
            destination_raw: u16::from_be_bytes([self.data[service + 4], self.data[service + 5]]),
            apci,
            apdu,
        })
    }
}
