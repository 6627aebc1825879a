//! OSDP command definitions

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::message::{SecurityBlock, SecurityBlockType};

/// Command codes (ACU to PD)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    // Status and identification
    Poll = 0x60,
    IdReport = 0x61,
    DeviceCapabilities = 0x62,
    LocalStatus = 0x64,
    InputStatus = 0x65,
    OutputStatus = 0x66,
    ReaderStatus = 0x67,

    // Peripheral control
    OutputControl = 0x68,
    LedControl = 0x69,
    BuzzerControl = 0x6A,
    TextOutput = 0x6B,
    CommunicationSet = 0x6E,

    // Biometrics
    BioRead = 0x73,
    BioMatch = 0x74,

    // Secure channel
    KeySet = 0x75,
    SessionChallenge = 0x76,
    ServerCryptogram = 0x77,

    // Transfers
    MaxReplySize = 0x7B,
    FileTransfer = 0x7C,
    ManufacturerSpecific = 0x80,
    ExtendedWrite = 0xA1,
    Abort = 0xA2,
    PivData = 0xA3,
    GenerateChallenge = 0xA4,
    AuthenticateChallenge = 0xA5,
    KeepActive = 0xA7,
}

impl CommandCode {
    /// Check if a PD requiring security must still answer this command unsecured
    ///
    /// Poll keeps the link alive before the handshake; identification,
    /// capabilities and communication settings are needed to bring a device up.
    pub fn allowed_without_security(self) -> bool {
        matches!(
            self,
            Self::Poll | Self::IdReport | Self::DeviceCapabilities | Self::CommunicationSet
        )
    }

    /// Check if this command belongs to the secure channel handshake
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::SessionChallenge | Self::ServerCryptogram)
    }

    /// Get command name
    pub fn name(self) -> &'static str {
        match self {
            Self::Poll => "osdp_POLL",
            Self::IdReport => "osdp_ID",
            Self::DeviceCapabilities => "osdp_CAP",
            Self::LocalStatus => "osdp_LSTAT",
            Self::InputStatus => "osdp_ISTAT",
            Self::OutputStatus => "osdp_OSTAT",
            Self::ReaderStatus => "osdp_RSTAT",
            Self::OutputControl => "osdp_OUT",
            Self::LedControl => "osdp_LED",
            Self::BuzzerControl => "osdp_BUZ",
            Self::TextOutput => "osdp_TEXT",
            Self::CommunicationSet => "osdp_COMSET",
            Self::BioRead => "osdp_BIOREAD",
            Self::BioMatch => "osdp_BIOMATCH",
            Self::KeySet => "osdp_KEYSET",
            Self::SessionChallenge => "osdp_CHLNG",
            Self::ServerCryptogram => "osdp_SCRYPT",
            Self::MaxReplySize => "osdp_ACURXSIZE",
            Self::FileTransfer => "osdp_FILETRANSFER",
            Self::ManufacturerSpecific => "osdp_MFG",
            Self::ExtendedWrite => "osdp_XWR",
            Self::Abort => "osdp_ABORT",
            Self::PivData => "osdp_PIVDATA",
            Self::GenerateChallenge => "osdp_GENAUTH",
            Self::AuthenticateChallenge => "osdp_CRAUTH",
            Self::KeepActive => "osdp_KEEPACTIVE",
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x60 => Ok(Self::Poll),
            0x61 => Ok(Self::IdReport),
            0x62 => Ok(Self::DeviceCapabilities),
            0x64 => Ok(Self::LocalStatus),
            0x65 => Ok(Self::InputStatus),
            0x66 => Ok(Self::OutputStatus),
            0x67 => Ok(Self::ReaderStatus),
            0x68 => Ok(Self::OutputControl),
            0x69 => Ok(Self::LedControl),
            0x6A => Ok(Self::BuzzerControl),
            0x6B => Ok(Self::TextOutput),
            0x6E => Ok(Self::CommunicationSet),
            0x73 => Ok(Self::BioRead),
            0x74 => Ok(Self::BioMatch),
            0x75 => Ok(Self::KeySet),
            0x76 => Ok(Self::SessionChallenge),
            0x77 => Ok(Self::ServerCryptogram),
            0x7B => Ok(Self::MaxReplySize),
            0x7C => Ok(Self::FileTransfer),
            0x80 => Ok(Self::ManufacturerSpecific),
            0xA1 => Ok(Self::ExtendedWrite),
            0xA2 => Ok(Self::Abort),
            0xA3 => Ok(Self::PivData),
            0xA4 => Ok(Self::GenerateChallenge),
            0xA5 => Ok(Self::AuthenticateChallenge),
            0xA7 => Ok(Self::KeepActive),
            _ => Err(Error::UnknownCode(value)),
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

/// Which key a handshake is keyed with
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeySlot {
    /// Well-known installation key (SCBK-D)
    Default,
    /// Key provisioned for this device (SCBK)
    Provisioned,
}

impl KeySlot {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Default => 0x00,
            Self::Provisioned => 0x01,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        if byte == 0x00 {
            Self::Default
        } else {
            Self::Provisioned
        }
    }
}

/// A command sent from the ACU to a PD
///
/// Handshake commands are modelled explicitly because the session engine builds
/// them; everything else is an opaque code plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bare poll
    Poll,

    /// Begin a secure channel session (osdp_CHLNG)
    SessionChallenge {
        server_random: [u8; 8],
        key_slot: KeySlot,
    },

    /// Prove possession of the key (osdp_SCRYPT)
    ServerCryptogram {
        cryptogram: [u8; 16],
        key_slot: KeySlot,
    },

    /// Any other command, already encoded by the payload catalog
    Payload {
        code: CommandCode,
        data: Bytes,
    },
}

impl Command {
    /// Create a payload command
    pub fn new(code: CommandCode, data: impl Into<Bytes>) -> Self {
        match code {
            CommandCode::Poll => Self::Poll,
            _ => Self::Payload {
                code,
                data: data.into(),
            },
        }
    }

    /// Command code on the wire
    pub fn code(&self) -> CommandCode {
        match self {
            Self::Poll => CommandCode::Poll,
            Self::SessionChallenge { .. } => CommandCode::SessionChallenge,
            Self::ServerCryptogram { .. } => CommandCode::ServerCryptogram,
            Self::Payload { code, .. } => *code,
        }
    }

    /// Encoded payload bytes
    pub fn data(&self) -> Bytes {
        match self {
            Self::Poll => Bytes::new(),
            Self::SessionChallenge { server_random, .. } => Bytes::copy_from_slice(server_random),
            Self::ServerCryptogram { cryptogram, .. } => Bytes::copy_from_slice(cryptogram),
            Self::Payload { data, .. } => data.clone(),
        }
    }

    /// Security block the handshake commands carry in clear
    pub fn handshake_block(&self) -> Option<SecurityBlock> {
        match self {
            Self::SessionChallenge { key_slot, .. } => Some(SecurityBlock::new(
                SecurityBlockType::BeginSession,
                [key_slot.to_byte()],
            )),
            Self::ServerCryptogram { key_slot, .. } => Some(SecurityBlock::new(
                SecurityBlockType::ServerCryptogram,
                [key_slot.to_byte()],
            )),
            _ => None,
        }
    }

    /// Check if this is a bare poll
    pub fn is_poll(&self) -> bool {
        matches!(self, Self::Poll)
    }

    /// Check if this is part of the handshake
    pub fn is_handshake(&self) -> bool {
        self.code().is_handshake()
    }

    /// Reconstruct a command from a decoded frame
    pub fn from_parts(code: CommandCode, block: Option<&SecurityBlock>, data: Bytes) -> Result<Self> {
        let key_slot = block
            .and_then(|b| b.data.first().copied())
            .map(KeySlot::from_byte)
            .unwrap_or(KeySlot::Provisioned);

        match code {
            CommandCode::Poll => Ok(Self::Poll),
            CommandCode::SessionChallenge => {
                let server_random = data.as_ref().try_into().map_err(|_| Error::PayloadTooShort {
                    what: "osdp_CHLNG",
                    expected: 8,
                    actual: data.len(),
                })?;
                Ok(Self::SessionChallenge {
                    server_random,
                    key_slot,
                })
            }
            CommandCode::ServerCryptogram => {
                let cryptogram = data.as_ref().try_into().map_err(|_| Error::PayloadTooShort {
                    what: "osdp_SCRYPT",
                    expected: 16,
                    actual: data.len(),
                })?;
                Ok(Self::ServerCryptogram {
                    cryptogram,
                    key_slot,
                })
            }
            _ => Ok(Self::Payload { code, data }),
        }
    }

    /// Serialize as `[code, data...]`, the form used by trace output
    pub fn to_bytes(&self) -> Bytes {
        let data = self.data();
        let mut buf = BytesMut::with_capacity(1 + data.len());
        buf.put_u8(self.code().into());
        buf.put_slice(&data);
        buf.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[len={}]", self.code(), self.data().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_code_conversion() {
        assert_eq!(u8::from(CommandCode::Poll), 0x60);
        assert_eq!(CommandCode::try_from(0x61).unwrap(), CommandCode::IdReport);
        assert_eq!(CommandCode::try_from(0xA3).unwrap(), CommandCode::PivData);
    }

    #[test]
    fn test_unknown_command_code() {
        assert!(matches!(CommandCode::try_from(0x01), Err(Error::UnknownCode(0x01))));
    }

    #[test]
    fn test_allowed_without_security() {
        assert!(CommandCode::IdReport.allowed_without_security());
        assert!(CommandCode::DeviceCapabilities.allowed_without_security());
        assert!(CommandCode::CommunicationSet.allowed_without_security());
        assert!(!CommandCode::OutputControl.allowed_without_security());
        assert!(!CommandCode::KeySet.allowed_without_security());
    }

    #[test]
    fn test_new_poll_is_bare() {
        let command = Command::new(CommandCode::Poll, vec![1, 2, 3]);
        assert_eq!(command, Command::Poll);
        assert!(command.data().is_empty());
    }

    #[test]
    fn test_handshake_blocks() {
        let chlng = Command::SessionChallenge {
            server_random: [1; 8],
            key_slot: KeySlot::Default,
        };
        let block = chlng.handshake_block().unwrap();
        assert_eq!(block.kind, SecurityBlockType::BeginSession);
        assert_eq!(block.data.as_ref(), &[0x00]);

        assert!(Command::Poll.handshake_block().is_none());
    }

    #[test]
    fn test_from_parts_challenge() {
        let block = SecurityBlock::new(SecurityBlockType::BeginSession, [0x01]);
        let command = Command::from_parts(
            CommandCode::SessionChallenge,
            Some(&block),
            Bytes::from_static(&[9; 8]),
        )
        .unwrap();

        assert_eq!(
            command,
            Command::SessionChallenge {
                server_random: [9; 8],
                key_slot: KeySlot::Provisioned,
            }
        );
    }

    #[test]
    fn test_from_parts_short_challenge() {
        let result = Command::from_parts(CommandCode::SessionChallenge, None, Bytes::from_static(&[1, 2]));
        assert!(matches!(result, Err(Error::PayloadTooShort { .. })));
    }
}
