//! Typed payloads for OSDP commands and replies
//!
//! The engine moves opaque `{code, bytes}` payloads; this crate gives the
//! ones the orchestration layer acts on a typed shape. Anything not listed
//! here stays raw.

pub mod card;
pub mod communication;
pub mod device_info;
pub mod error;
pub mod file_transfer;
pub mod piv;

pub use card::{KeypadData, RawCardData};
pub use communication::CommunicationConfiguration;
pub use device_info::{
    CapabilitiesRequest, Capability, CapabilityFunction, DeviceCapabilities, DeviceIdentification, IdReportRequest,
};
pub use error::{Error, Result};
pub use file_transfer::{FileTransferActions, FileTransferFragment, FileTransferStatus, FileTransferStatusCode};
pub use piv::{GetPivData, PivDataFragment};

use bytes::Bytes;
use osdp_core::{Command, CommandCode, ErrorCode, Reply, ReplyCode};

/// Payload of a command the ACU sends
pub trait CommandPayload {
    const CODE: CommandCode;

    fn encode(&self) -> Bytes;

    fn into_command(&self) -> Command {
        Command::new(Self::CODE, self.encode())
    }
}

/// Payload of a reply the PD sends
pub trait ReplyPayload: Sized {
    const CODE: ReplyCode;

    fn decode(data: &[u8]) -> Result<Self>;

    fn encode(&self) -> Bytes;

    /// Decode from a reply, checking its code
    fn from_reply(reply: &Reply) -> Result<Self> {
        let expected = u8::from(Self::CODE);
        if reply.code() != expected {
            return Err(Error::UnexpectedCode {
                expected,
                actual: reply.code(),
            });
        }
        Self::decode(&reply.data())
    }

    fn into_reply(&self) -> Reply {
        Reply::new(Self::CODE, self.encode())
    }
}

/// A reply, decoded as far as this catalog knows how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyData {
    Ack,
    Nak(ErrorCode),
    Busy,
    Identification(DeviceIdentification),
    Capabilities(DeviceCapabilities),
    CommunicationSettings(CommunicationConfiguration),
    RawCard(RawCardData),
    Keypad(KeypadData),
    FileTransferStatus(FileTransferStatus),
    PivData(PivDataFragment),
    /// Code this catalog does not decode
    Raw { code: u8, data: Bytes },
}

/// Decode a reply
///
/// # Errors
///
/// Fails when a known code carries a malformed payload.
pub fn parse_reply(reply: &Reply) -> Result<ReplyData> {
    let data = reply.data();

    let parsed = match reply {
        Reply::Ack => ReplyData::Ack,
        Reply::Nak(code) => ReplyData::Nak(*code),
        Reply::Busy => ReplyData::Busy,
        _ => match ReplyCode::try_from(reply.code()) {
            Ok(ReplyCode::IdReport) => ReplyData::Identification(DeviceIdentification::decode(&data)?),
            Ok(ReplyCode::DeviceCapabilities) => ReplyData::Capabilities(DeviceCapabilities::decode(&data)?),
            Ok(ReplyCode::CommunicationSettings) => {
                ReplyData::CommunicationSettings(CommunicationConfiguration::decode(&data)?)
            }
            Ok(ReplyCode::RawReaderData) => ReplyData::RawCard(RawCardData::decode(&data)?),
            Ok(ReplyCode::KeypadData) => ReplyData::Keypad(KeypadData::decode(&data)?),
            Ok(ReplyCode::FileTransferStatus) => ReplyData::FileTransferStatus(FileTransferStatus::decode(&data)?),
            Ok(ReplyCode::PivData) => ReplyData::PivData(PivDataFragment::decode(&data)?),
            _ => ReplyData::Raw {
                code: reply.code(),
                data,
            },
        },
    };

    Ok(parsed)
}

/// A command, decoded as far as this catalog knows how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandData {
    Poll,
    IdReport,
    Capabilities,
    CommunicationSet(CommunicationConfiguration),
    FileTransfer(FileTransferFragment),
    GetPivData(GetPivData),
    /// Code this catalog does not decode
    Raw { code: CommandCode, data: Bytes },
}

/// Decode a command received by a PD
pub fn parse_command(command: &Command) -> Result<CommandData> {
    let data = command.data();

    let parsed = match command.code() {
        CommandCode::Poll => CommandData::Poll,
        CommandCode::IdReport => CommandData::IdReport,
        CommandCode::DeviceCapabilities => CommandData::Capabilities,
        CommandCode::CommunicationSet => {
            CommandData::CommunicationSet(CommunicationConfiguration::decode_command(&data)?)
        }
        CommandCode::FileTransfer => CommandData::FileTransfer(FileTransferFragment::decode(&data)?),
        CommandCode::PivData => CommandData::GetPivData(GetPivData::decode(&data)?),
        code => CommandData::Raw { code, data },
    };

    Ok(parsed)
}
