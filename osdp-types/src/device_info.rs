//! Device identification and capabilities

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use osdp_core::{CommandCode, ReplyCode};

use crate::{CommandPayload, ReplyPayload, error::*};

/// osdp_ID: ask for the device identification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdReportRequest;

impl CommandPayload for IdReportRequest {
    const CODE: CommandCode = CommandCode::IdReport;

    fn encode(&self) -> Bytes {
        // Reply type 0: standard identification
        Bytes::from_static(&[0x00])
    }
}

/// osdp_CAP: ask for the capability list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitiesRequest;

impl CommandPayload for CapabilitiesRequest {
    const CODE: CommandCode = CommandCode::DeviceCapabilities;

    fn encode(&self) -> Bytes {
        Bytes::from_static(&[0x00])
    }
}

/// Device identification (osdp_PDID)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentification {
    /// IEEE OUI of the manufacturer
    pub vendor_code: [u8; 3],

    /// Manufacturer's model number
    pub model_number: u8,

    /// Hardware version
    pub version: u8,

    /// Device serial number
    pub serial_number: u32,

    /// Firmware version: major, minor, build
    pub firmware_version: (u8, u8, u8),
}

impl DeviceIdentification {
    pub const SIZE: usize = 12;

    /// Firmware version as `major.minor.build`
    pub fn firmware(&self) -> String {
        let (major, minor, build) = self.firmware_version;
        format!("{}.{}.{}", major, minor, build)
    }
}

impl ReplyPayload for DeviceIdentification {
    const CODE: ReplyCode = ReplyCode::IdReport;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::too_short("osdp_PDID", Self::SIZE, data.len()));
        }

        let mut cursor = Cursor::new(data);
        let mut vendor_code = [0u8; 3];
        std::io::Read::read_exact(&mut cursor, &mut vendor_code)?;

        Ok(Self {
            vendor_code,
            model_number: cursor.read_u8()?,
            version: cursor.read_u8()?,
            serial_number: cursor.read_u32::<LittleEndian>()?,
            firmware_version: (cursor.read_u8()?, cursor.read_u8()?, cursor.read_u8()?),
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.vendor_code);
        buf.push(self.model_number);
        buf.push(self.version);
        // Writing to a Vec cannot fail
        let _ = buf.write_u32::<LittleEndian>(self.serial_number);
        let (major, minor, build) = self.firmware_version;
        buf.extend_from_slice(&[major, minor, build]);
        Bytes::from(buf)
    }
}

impl fmt::Display for DeviceIdentification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device[Vendor: {:02X}{:02X}{:02X}, Model: {}, SN: {}, FW: {}]",
            self.vendor_code[0],
            self.vendor_code[1],
            self.vendor_code[2],
            self.model_number,
            self.serial_number,
            self.firmware()
        )
    }
}

/// Capability function codes used by the engine
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CapabilityFunction {
    ContactStatusMonitoring = 1,
    OutputControl = 2,
    CardDataFormat = 3,
    ReaderLedControl = 4,
    ReaderAudibleOutput = 5,
    ReaderTextOutput = 6,
    TimeKeeping = 7,
    CheckCharacterSupport = 8,
    CommunicationSecurity = 9,
    ReceiveBufferSize = 10,
    LargestCombinedMessageSize = 11,
    SmartCardSupport = 12,
    Readers = 13,
    Biometrics = 14,
}

/// One entry of the capability list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub function: u8,
    pub compliance: u8,
    pub number_of: u8,
}

impl Capability {
    pub fn new(function: CapabilityFunction, compliance: u8, number_of: u8) -> Self {
        Self {
            function: function as u8,
            compliance,
            number_of,
        }
    }

    /// `compliance` and `number_of` read together as a little-endian size
    pub fn as_size(&self) -> u16 {
        u16::from_le_bytes([self.compliance, self.number_of])
    }
}

/// Device capabilities (osdp_PDCAP)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub capabilities: Vec<Capability>,
}

impl DeviceCapabilities {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    pub fn get(&self, function: CapabilityFunction) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.function == function as u8)
    }

    /// Size of the PD's receive buffer
    pub fn receive_buffer_size(&self) -> Option<u16> {
        self.get(CapabilityFunction::ReceiveBufferSize).map(Capability::as_size)
    }

    /// Largest multi-part message the PD accepts
    pub fn largest_combined_message_size(&self) -> Option<u16> {
        self.get(CapabilityFunction::LargestCombinedMessageSize)
            .map(Capability::as_size)
    }

    /// Check if the PD supports CRC-16 trailers
    pub fn supports_crc(&self) -> bool {
        self.get(CapabilityFunction::CheckCharacterSupport)
            .is_some_and(|c| c.compliance == 1)
    }

    /// Check if the PD supports the secure channel
    pub fn supports_secure_channel(&self) -> bool {
        self.get(CapabilityFunction::CommunicationSecurity)
            .is_some_and(|c| c.compliance & 0x01 != 0)
    }
}

impl ReplyPayload for DeviceCapabilities {
    const CODE: ReplyCode = ReplyCode::DeviceCapabilities;

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() % 3 != 0 {
            return Err(Error::Parse(format!(
                "osdp_PDCAP length {} is not a multiple of 3",
                data.len()
            )));
        }

        let capabilities = data
            .chunks_exact(3)
            .map(|c| Capability {
                function: c[0],
                compliance: c[1],
                number_of: c[2],
            })
            .collect();

        Ok(Self { capabilities })
    }

    fn encode(&self) -> Bytes {
        self.capabilities
            .iter()
            .flat_map(|c| [c.function, c.compliance, c.number_of])
            .collect::<Vec<_>>()
            .into()
    }
}
