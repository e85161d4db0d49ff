//! Registry of datapoint types by canonical name.
//!
//! Maps names like `"1.001"` or `"9.004"` to a [`DptDescriptor`] holding a
//! factory for the zero value and a typed APDU decoder. The mapping is built
//! from a fixed table on first use and never mutated afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::dpt::{decode_dpt9, percent_from_byte, DptValue};
use crate::error::DptError;

/// Description of one datapoint type.
pub struct DptDescriptor {
    /// Canonical type name, `main.sub` with a three-digit sub number.
    pub id: &'static str,
    /// Human-readable description.
    pub name: &'static str,
    new_fn: fn() -> DptValue,
    decode_fn: fn(&[u8]) -> Result<DptValue, DptError>,
}

impl DptDescriptor {
    /// Produce the zero value of this type.
    pub fn produce(&self) -> DptValue {
        (self.new_fn)()
    }

    /// Decode an APDU as this type.
    pub fn decode(&self, apdu: &[u8]) -> Result<DptValue, DptError> {
        (self.decode_fn)(apdu)
    }
}

fn new_bool() -> DptValue {
    DptValue::Bool(false)
}

fn new_step() -> DptValue {
    DptValue::Control3Bit { increase: false, step: 0 }
}

fn new_percent() -> DptValue {
    DptValue::Percent(0)
}

fn new_unsigned8() -> DptValue {
    DptValue::Unsigned8(0)
}

fn new_unsigned16() -> DptValue {
    DptValue::Unsigned16(0)
}

fn new_float16() -> DptValue {
    DptValue::Float16(0.0)
}

fn new_signed32() -> DptValue {
    DptValue::Signed32(0)
}

fn decode_bool(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [octet] => Ok(DptValue::Bool(octet & 0x01 != 0)),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_step(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [octet] => Ok(DptValue::Control3Bit { increase: octet & 0x08 != 0, step: octet & 0x07 }),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_percent(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [_, raw] => Ok(DptValue::Percent(percent_from_byte(*raw))),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_unsigned8(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [_, raw] => Ok(DptValue::Unsigned8(*raw)),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_unsigned16(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [_, hi, lo] => Ok(DptValue::Unsigned16(u16::from_be_bytes([*hi, *lo]))),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_float16(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [_, hi, lo] => Ok(DptValue::Float16(decode_dpt9(u16::from_be_bytes([*hi, *lo])))),
        _ => Err(DptError::InvalidData),
    }
}

fn decode_signed32(apdu: &[u8]) -> Result<DptValue, DptError> {
    match apdu {
        [_, a, b, c, d] => Ok(DptValue::Signed32(i32::from_be_bytes([*a, *b, *c, *d]))),
        _ => Err(DptError::InvalidData),
    }
}

static TABLE: &[DptDescriptor] = &[
    DptDescriptor { id: "1.001", name: "switch", new_fn: new_bool, decode_fn: decode_bool },
    DptDescriptor { id: "1.002", name: "boolean", new_fn: new_bool, decode_fn: decode_bool },
    DptDescriptor { id: "1.003", name: "enable", new_fn: new_bool, decode_fn: decode_bool },
    DptDescriptor { id: "1.009", name: "open/close", new_fn: new_bool, decode_fn: decode_bool },
    DptDescriptor { id: "1.010", name: "start/stop", new_fn: new_bool, decode_fn: decode_bool },
    DptDescriptor { id: "3.007", name: "dimming control", new_fn: new_step, decode_fn: decode_step },
    DptDescriptor { id: "3.008", name: "blinds control", new_fn: new_step, decode_fn: decode_step },
    DptDescriptor { id: "5.001", name: "scaling (%)", new_fn: new_percent, decode_fn: decode_percent },
    DptDescriptor { id: "5.004", name: "percent (0..255)", new_fn: new_unsigned8, decode_fn: decode_unsigned8 },
    DptDescriptor { id: "5.010", name: "counter pulses", new_fn: new_unsigned8, decode_fn: decode_unsigned8 },
    DptDescriptor { id: "7.001", name: "pulses", new_fn: new_unsigned16, decode_fn: decode_unsigned16 },
    DptDescriptor { id: "9.001", name: "temperature (°C)", new_fn: new_float16, decode_fn: decode_float16 },
    DptDescriptor { id: "9.004", name: "illuminance (lux)", new_fn: new_float16, decode_fn: decode_float16 },
    DptDescriptor { id: "9.005", name: "wind speed (m/s)", new_fn: new_float16, decode_fn: decode_float16 },
    DptDescriptor { id: "9.007", name: "humidity (%)", new_fn: new_float16, decode_fn: decode_float16 },
    DptDescriptor { id: "13.001", name: "counter pulses (signed)", new_fn: new_signed32, decode_fn: decode_signed32 },
    DptDescriptor { id: "13.002", name: "flow rate (m³/h)", new_fn: new_signed32, decode_fn: decode_signed32 },
    DptDescriptor { id: "13.010", name: "active energy (Wh)", new_fn: new_signed32, decode_fn: decode_signed32 },
];

fn registry() -> &'static HashMap<&'static str, &'static DptDescriptor> {
    static REGISTRY: OnceLock<HashMap<&'static str, &'static DptDescriptor>> = OnceLock::new();
    REGISTRY.get_or_init(|| TABLE.iter().map(|descriptor| (descriptor.id, descriptor)).collect())
}

/// Look up a datapoint type by canonical name.
pub fn lookup(id: &str) -> Option<&'static DptDescriptor> {
    registry().get(id).copied()
}

/// Create the zero value of the named datapoint type, e.g. `"1.001"`.
pub fn produce(id: &str) -> Option<DptValue> {
    lookup(id).map(DptDescriptor::produce)
}

/// Names of all known datapoint types, sorted.
pub fn supported_types() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = TABLE.iter().map(|descriptor| descriptor.id).collect();
    ids.sort_unstable();
    ids
}
