//! OSDP reply definitions

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{SecurityBlock, SecurityBlockType};

/// Reply codes (PD to ACU)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    Ack = 0x40,
    Nak = 0x41,
    IdReport = 0x45,
    DeviceCapabilities = 0x46,
    LocalStatus = 0x48,
    InputStatus = 0x49,
    OutputStatus = 0x4A,
    ReaderStatus = 0x4B,
    RawReaderData = 0x50,
    FormattedReaderData = 0x51,
    KeypadData = 0x53,
    CommunicationSettings = 0x54,
    BiometricData = 0x57,
    BiometricMatch = 0x58,
    ClientCryptogram = 0x76,
    InitialRmac = 0x78,
    Busy = 0x79,
    FileTransferStatus = 0x7A,
    PivData = 0x80,
    GenerateChallenge = 0x81,
    AuthenticateChallenge = 0x82,
    ManufacturerSpecific = 0x90,
    ExtendedRead = 0xB1,
}

impl ReplyCode {
    /// Get reply name
    pub fn name(self) -> &'static str {
        match self {
            Self::Ack => "osdp_ACK",
            Self::Nak => "osdp_NAK",
            Self::IdReport => "osdp_PDID",
            Self::DeviceCapabilities => "osdp_PDCAP",
            Self::LocalStatus => "osdp_LSTATR",
            Self::InputStatus => "osdp_ISTATR",
            Self::OutputStatus => "osdp_OSTATR",
            Self::ReaderStatus => "osdp_RSTATR",
            Self::RawReaderData => "osdp_RAW",
            Self::FormattedReaderData => "osdp_FMT",
            Self::KeypadData => "osdp_KEYPAD",
            Self::CommunicationSettings => "osdp_COM",
            Self::BiometricData => "osdp_BIOREADR",
            Self::BiometricMatch => "osdp_BIOMATCHR",
            Self::ClientCryptogram => "osdp_CCRYPT",
            Self::InitialRmac => "osdp_RMAC_I",
            Self::Busy => "osdp_BUSY",
            Self::FileTransferStatus => "osdp_FTSTAT",
            Self::PivData => "osdp_PIVDATAR",
            Self::GenerateChallenge => "osdp_GENAUTHR",
            Self::AuthenticateChallenge => "osdp_CRAUTHR",
            Self::ManufacturerSpecific => "osdp_MFGREP",
            Self::ExtendedRead => "osdp_XRD",
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x40 => Ok(Self::Ack),
            0x41 => Ok(Self::Nak),
            0x45 => Ok(Self::IdReport),
            0x46 => Ok(Self::DeviceCapabilities),
            0x48 => Ok(Self::LocalStatus),
            0x49 => Ok(Self::InputStatus),
            0x4A => Ok(Self::OutputStatus),
            0x4B => Ok(Self::ReaderStatus),
            0x50 => Ok(Self::RawReaderData),
            0x51 => Ok(Self::FormattedReaderData),
            0x53 => Ok(Self::KeypadData),
            0x54 => Ok(Self::CommunicationSettings),
            0x57 => Ok(Self::BiometricData),
            0x58 => Ok(Self::BiometricMatch),
            0x76 => Ok(Self::ClientCryptogram),
            0x78 => Ok(Self::InitialRmac),
            0x79 => Ok(Self::Busy),
            0x7A => Ok(Self::FileTransferStatus),
            0x80 => Ok(Self::PivData),
            0x81 => Ok(Self::GenerateChallenge),
            0x82 => Ok(Self::AuthenticateChallenge),
            0x90 => Ok(Self::ManufacturerSpecific),
            0xB1 => Ok(Self::ExtendedRead),
            _ => Err(Error::UnknownCode(value)),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

/// NAK error codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    BadChecksumOrCrc,
    InvalidCommandLength,
    UnknownCommandCode,
    UnexpectedSequenceNumber,
    DoesNotSupportSecurityBlock,
    CommunicationSecurityNotMet,
    BioTypeNotSupported,
    BioFormatNotSupported,
    UnableToProcessCommand,
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::BadChecksumOrCrc,
            0x02 => Self::InvalidCommandLength,
            0x03 => Self::UnknownCommandCode,
            0x04 => Self::UnexpectedSequenceNumber,
            0x05 => Self::DoesNotSupportSecurityBlock,
            0x06 => Self::CommunicationSecurityNotMet,
            0x07 => Self::BioTypeNotSupported,
            0x08 => Self::BioFormatNotSupported,
            0x09 => Self::UnableToProcessCommand,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        match code {
            ErrorCode::NoError => 0x00,
            ErrorCode::BadChecksumOrCrc => 0x01,
            ErrorCode::InvalidCommandLength => 0x02,
            ErrorCode::UnknownCommandCode => 0x03,
            ErrorCode::UnexpectedSequenceNumber => 0x04,
            ErrorCode::DoesNotSupportSecurityBlock => 0x05,
            ErrorCode::CommunicationSecurityNotMet => 0x06,
            ErrorCode::BioTypeNotSupported => 0x07,
            ErrorCode::BioFormatNotSupported => 0x08,
            ErrorCode::UnableToProcessCommand => 0x09,
            ErrorCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Other(0x{:02X})", code),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// A reply sent from a PD to the ACU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// General acknowledge
    Ack,

    /// Negative acknowledge
    Nak(ErrorCode),

    /// PD side of the handshake (osdp_CCRYPT)
    ClientCryptogram {
        client_uid: [u8; 8],
        client_random: [u8; 8],
        cryptogram: [u8; 16],
    },

    /// Handshake completion carrying the initial reply MAC (osdp_RMAC_I)
    InitialRmac {
        rmac: [u8; 16],
        accepted: bool,
    },

    /// PD asks the ACU to back off
    Busy,

    /// Any other reply, decoded further by the payload catalog
    Payload {
        code: u8,
        data: Bytes,
    },
}

impl Reply {
    /// Create a payload reply
    pub fn new(code: ReplyCode, data: impl Into<Bytes>) -> Self {
        Self::Payload {
            code: code.into(),
            data: data.into(),
        }
    }

    /// Reply code on the wire
    pub fn code(&self) -> u8 {
        match self {
            Self::Ack => ReplyCode::Ack.into(),
            Self::Nak(_) => ReplyCode::Nak.into(),
            Self::ClientCryptogram { .. } => ReplyCode::ClientCryptogram.into(),
            Self::InitialRmac { .. } => ReplyCode::InitialRmac.into(),
            Self::Busy => ReplyCode::Busy.into(),
            Self::Payload { code, .. } => *code,
        }
    }

    /// Encoded payload bytes
    pub fn data(&self) -> Bytes {
        match self {
            Self::Ack | Self::Busy => Bytes::new(),
            Self::Nak(code) => Bytes::copy_from_slice(&[u8::from(*code)]),
            Self::ClientCryptogram {
                client_uid,
                client_random,
                cryptogram,
            } => {
                let mut data = Vec::with_capacity(32);
                data.extend_from_slice(client_uid);
                data.extend_from_slice(client_random);
                data.extend_from_slice(cryptogram);
                Bytes::from(data)
            }
            Self::InitialRmac { rmac, .. } => Bytes::copy_from_slice(rmac),
            Self::Payload { data, .. } => data.clone(),
        }
    }

    /// Security block the handshake replies carry in clear
    pub fn handshake_block(&self, key_slot: u8) -> Option<SecurityBlock> {
        match self {
            Self::ClientCryptogram { .. } => Some(SecurityBlock::new(
                SecurityBlockType::ClientCryptogram,
                [key_slot],
            )),
            Self::InitialRmac { accepted, .. } => Some(SecurityBlock::new(
                SecurityBlockType::InitialRmac,
                [if *accepted { 0x01 } else { 0xFF }],
            )),
            _ => None,
        }
    }

    /// Reconstruct a reply from a decoded frame
    ///
    /// Unknown codes and malformed handshake payloads are kept as
    /// [`Reply::Payload`] so the codec never fails on content.
    pub fn from_parts(code: u8, block: Option<&SecurityBlock>, data: Bytes) -> Self {
        match ReplyCode::try_from(code) {
            Ok(ReplyCode::Ack) => Self::Ack,
            Ok(ReplyCode::Busy) => Self::Busy,
            Ok(ReplyCode::Nak) if !data.is_empty() => Self::Nak(ErrorCode::from(data[0])),
            Ok(ReplyCode::ClientCryptogram) if data.len() >= 32 => {
                let mut client_uid = [0u8; 8];
                let mut client_random = [0u8; 8];
                let mut cryptogram = [0u8; 16];
                client_uid.copy_from_slice(&data[0..8]);
                client_random.copy_from_slice(&data[8..16]);
                cryptogram.copy_from_slice(&data[16..32]);
                Self::ClientCryptogram {
                    client_uid,
                    client_random,
                    cryptogram,
                }
            }
            Ok(ReplyCode::InitialRmac) if data.len() >= 16 => {
                let mut rmac = [0u8; 16];
                rmac.copy_from_slice(&data[0..16]);
                let accepted = block
                    .and_then(|b| b.data.first().copied())
                    .is_none_or(|b| b == 0x01);
                Self::InitialRmac { rmac, accepted }
            }
            _ => Self::Payload { code, data },
        }
    }

    /// Check if this reply is a NAK
    pub fn is_nak(&self) -> bool {
        matches!(self, Self::Nak(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ReplyCode::try_from(self.code()) {
            Ok(code) => write!(f, "{}[len={}]", code, self.data().len()),
            Err(_) => write!(f, "reply(0x{:02X})[len={}]", self.code(), self.data().len()),
        }
    }
}
