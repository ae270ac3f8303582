//! Packet decode and classification.
//!
//! A block (marker already stripped by the framer) has the fixed layout
//! `[id1][id2][moduleID][framebyte][time1][time2][payload(N)][checksum]`
//! with `N = 2 * 2^(id1 >> 5)`. The framebyte selects the packet kind:
//! 255 is a query reply, 254 a sensor-reported error, anything lower a
//! measurement frame — except that module-ID `0xA4` always marks a MicroFlu
//! ROM-configuration reply regardless of framebyte.

use std::fmt;
use std::time::Duration;

use super::{BLOCK_HEADER_LEN, block_len, payload_len};
use crate::{AcquisitionError, Result};

/// Module-ID byte value reserved for MicroFlu ROM-configuration replies.
pub const MFCONFIG_MODULE_ID: u8 = 0xA4;

/// Framebyte sentinel for a sensor-reported protocol error.
pub const FRAME_ERROR: u8 = 254;

/// Framebyte sentinel for a query reply.
pub const FRAME_QUERY: u8 = 255;

/// Operating frequency table in MHz, indexed by the query-reply frequency
/// byte; index 0 is "unknown".
const FREQUENCY_MHZ: [Option<u8>; 8] =
    [None, Some(2), Some(4), Some(6), Some(8), Some(10), Some(12), Some(20)];

/// Sensor address: three 2-hex-digit fields derived from a packet's
/// identity bytes — the identity bits of id1 and the two halves of the
/// channel address byte. The module-ID byte is deliberately excluded: it
/// varies by reply kind (a config reply carries `0xA4`) while the TID must
/// stay stable for one sensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid([u8; 3]);

impl Tid {
    pub(crate) fn from_header(id1: u8, id2: u8) -> Self {
        Self([id1 & 0x1F, id2 >> 4, id2 & 0x0F])
    }

    /// The one-byte channel address used when commanding this sensor.
    pub fn address(&self) -> u8 {
        (self.0[1] << 4) | self.0[2]
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Module types, from the 5-bit code carried in the high serial byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    MicroFlu,
    Iom,
    Com,
    Ips,
    SamIp,
    Scm,
    Sam,
    Dfm,
    Adm,
    Unknown,
}

impl ModuleType {
    /// Map the 5-bit module code (`serial_high >> 3`) to a module type.
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => ModuleType::MicroFlu,
            4 => ModuleType::Iom,
            8 => ModuleType::Com,
            9 => ModuleType::Ips,
            10 => ModuleType::SamIp,
            12 => ModuleType::Scm,
            16 => ModuleType::Sam,
            20 => ModuleType::Dfm,
            24 => ModuleType::Adm,
            _ => ModuleType::Unknown,
        }
    }

    /// Spectral modules take part in synchronized sampling.
    pub fn is_spectral(&self) -> bool {
        matches!(self, ModuleType::Sam | ModuleType::SamIp)
    }

    /// How long a triggered measurement may take before the sensor counts
    /// as missing.
    pub fn response_timeout(&self) -> Duration {
        match self {
            ModuleType::Sam | ModuleType::SamIp => Duration::from_secs(12),
            _ => Duration::from_secs(5),
        }
    }
}

/// Packet kind, decided by framebyte and module-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// MicroFlu ROM-configuration reply (module-ID `0xA4`).
    MfConfig,
    /// Sensor-reported protocol error.
    Error,
    /// Query reply carrying module identity.
    Query,
    /// Measurement frame.
    Measurement,
}

/// A decoded protocol packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub size_exponent: u8,
    pub identity: u8,
    pub module_id: u8,
    pub zipped: bool,
    pub i2c_address: u8,
    pub framebyte: u8,
    pub time: u16,
    pub payload: Vec<u8>,
    pub checksum: u8,
    pub tid: Tid,
}

impl Packet {
    /// Decode one framed block. The block length must match the size code
    /// exactly; anything else is a [`DecodeError`](AcquisitionError::Decode).
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < BLOCK_HEADER_LEN + 1 {
            return Err(AcquisitionError::Decode {
                expected: BLOCK_HEADER_LEN + 1,
                actual: block.len(),
            });
        }
        let id1 = block[0];
        let size_exponent = id1 >> 5;
        let n = payload_len(size_exponent);
        let expected = block_len(n);
        if block.len() != expected {
            return Err(AcquisitionError::Decode { expected, actual: block.len() });
        }

        let id2 = block[1];
        let module_id = block[2];
        Ok(Self {
            size_exponent,
            identity: id1 & 0x1F,
            module_id,
            zipped: module_id & 0x80 != 0,
            i2c_address: module_id & 0x7F,
            framebyte: block[3],
            time: u16::from_be_bytes([block[4], block[5]]),
            payload: block[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + n].to_vec(),
            checksum: block[expected - 1],
            tid: Tid::from_header(id1, id2),
        })
    }

    /// Classify the packet. Module-ID wins over framebyte so a config reply
    /// is never misread as a measurement.
    pub fn kind(&self) -> PacketKind {
        if self.module_id == MFCONFIG_MODULE_ID {
            PacketKind::MfConfig
        } else if self.framebyte == FRAME_ERROR {
            PacketKind::Error
        } else if self.framebyte == FRAME_QUERY {
            PacketKind::Query
        } else {
            PacketKind::Measurement
        }
    }

    /// Decode the module identity out of a query reply payload.
    pub fn query_info(&self) -> Result<ModuleInfo> {
        if self.payload.len() < 5 {
            return Err(AcquisitionError::protocol(
                self.tid.to_string(),
                format!("query reply payload too short: {} bytes", self.payload.len()),
            ));
        }
        let serial = u16::from_le_bytes([self.payload[0], self.payload[1]]);
        let module_type = ModuleType::from_code((serial >> 8) as u8 >> 3);
        let firmware = f32::from(self.payload[3]) + 0.01 * f32::from(self.payload[2]);
        let frequency_mhz = FREQUENCY_MHZ[(self.payload[4] & 0x07) as usize];
        Ok(ModuleInfo {
            tid: self.tid,
            address: self.tid.address(),
            module_type,
            serial,
            firmware,
            frequency_mhz,
        })
    }
}

/// Identity of a module, decoded from its query reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleInfo {
    pub tid: Tid,
    pub address: u8,
    pub module_type: ModuleType,
    pub serial: u16,
    pub firmware: f32,
    pub frequency_mhz: Option<u8>,
}
